use std::path::PathBuf;
use std::time::Duration;

/// Which container runtime backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Base used to build the externally reachable `url` of a service.
    pub public_base_url: String,
    /// Base the request testing helper uses to reach this gateway.
    pub self_base_url: String,
    /// Persisted registry document.
    pub data_file: PathBuf,
    /// Parent directory of the per-service scratch build contexts.
    pub build_root: PathBuf,
    pub runtime: RuntimeKind,
    pub docker_socket: Option<String>,
    /// Internal container network; services get no host port bindings.
    pub network: String,
    /// Port every service listens on inside its container.
    pub internal_port: u16,
    pub default_base_image: String,
    /// Collaborator defaults injected into every container (overridable per service).
    pub collaborator_base_url: String,
    pub collaborator_project_id: String,
    pub auth: AuthConfig,
    /// Max concurrent image builds.
    pub build_concurrency: usize,
    pub build_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub restart_timeout_secs: u64,
    /// Seconds a container gets to stop gracefully before it is killed.
    pub stop_grace_secs: u32,
    pub forward_timeout_secs: u64,
    /// Retries for transient upstream failures. Keep at 0 for non-idempotent services.
    pub forward_retries: u32,
    /// Background reconciliation period. 0 = disabled.
    pub reconcile_interval_secs: u64,
    pub dashboard_origin: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub base_url: String,
    pub contract: String,
    /// Emails under this domain may create/delete services regardless of role.
    pub admin_email_domain: String,
    pub cache_ttl_secs: u64,
}

impl Config {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    /// Defaults suitable for tests and local runs against the in-memory runtime.
    pub fn for_local(data_file: PathBuf, build_root: PathBuf) -> Self {
        let port = 4000;
        Self {
            port,
            public_base_url: format!("http://localhost:{}", port),
            self_base_url: format!("http://127.0.0.1:{}", port),
            data_file,
            build_root,
            runtime: RuntimeKind::Memory,
            docker_socket: None,
            network: "microservices-network".into(),
            internal_port: 3000,
            default_base_image: "node:18-alpine".into(),
            collaborator_base_url: DEFAULT_COLLABORATOR_URL.into(),
            collaborator_project_id: DEFAULT_PROJECT_ID.into(),
            auth: AuthConfig {
                enabled: false,
                base_url: DEFAULT_COLLABORATOR_URL.into(),
                contract: DEFAULT_PROJECT_ID.into(),
                admin_email_domain: "uninorte.edu.co".into(),
                cache_ttl_secs: 60,
            },
            build_concurrency: 2,
            build_timeout_secs: 600,
            start_timeout_secs: 60,
            stop_timeout_secs: 30,
            restart_timeout_secs: 60,
            stop_grace_secs: 10,
            forward_timeout_secs: 30,
            forward_retries: 0,
            reconcile_interval_secs: 0,
            dashboard_origin: format!("http://localhost:{}", port),
        }
    }
}

const DEFAULT_COLLABORATOR_URL: &str = "https://roble-api.openlab.uninorte.edu.co";
const DEFAULT_PROJECT_ID: &str = "pc2_3e6afe53f1";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let port: u16 = env_parse("MSGATE_PORT", 4000);

    let runtime = match env_or("MSGATE_RUNTIME", "docker").to_lowercase().as_str() {
        "docker" => RuntimeKind::Docker,
        "memory" => RuntimeKind::Memory,
        other => anyhow::bail!("MSGATE_RUNTIME must be 'docker' or 'memory', got '{}'", other),
    };

    let public_base_url = env_or("MSGATE_PUBLIC_BASE_URL", &format!("http://localhost:{}", port));
    url::Url::parse(&public_base_url)
        .map_err(|e| anyhow::anyhow!("MSGATE_PUBLIC_BASE_URL is not a valid URL: {}", e))?;

    let self_base_url = env_or("MSGATE_SELF_BASE_URL", &format!("http://127.0.0.1:{}", port));
    url::Url::parse(&self_base_url)
        .map_err(|e| anyhow::anyhow!("MSGATE_SELF_BASE_URL is not a valid URL: {}", e))?;

    let build_concurrency: usize = env_parse("MSGATE_BUILD_CONCURRENCY", 2);
    if build_concurrency == 0 {
        anyhow::bail!("MSGATE_BUILD_CONCURRENCY must be at least 1");
    }

    Ok(Config {
        port,
        public_base_url: public_base_url.trim_end_matches('/').to_string(),
        self_base_url: self_base_url.trim_end_matches('/').to_string(),
        data_file: PathBuf::from(env_or("MSGATE_DATA_FILE", "data/microservices.json")),
        build_root: PathBuf::from(env_or("MSGATE_BUILD_ROOT", "temp")),
        runtime,
        docker_socket: std::env::var("DOCKER_SOCKET").ok().filter(|s| !s.is_empty()),
        network: env_or("MSGATE_NETWORK", "microservices-network"),
        internal_port: env_parse("MSGATE_INTERNAL_PORT", 3000),
        default_base_image: env_or("MSGATE_DEFAULT_BASE_IMAGE", "node:18-alpine"),
        collaborator_base_url: env_or("ROBLE_BASE_URL", DEFAULT_COLLABORATOR_URL),
        collaborator_project_id: env_or("ROBLE_PROJECT_ID", DEFAULT_PROJECT_ID),
        auth: AuthConfig {
            enabled: env_parse("MSGATE_AUTH_ENABLED", false),
            base_url: env_or("ROBLE_BASE_HOST", DEFAULT_COLLABORATOR_URL),
            contract: env_or("ROBLE_CONTRACT", DEFAULT_PROJECT_ID),
            admin_email_domain: env_or("MSGATE_ADMIN_EMAIL_DOMAIN", "uninorte.edu.co"),
            cache_ttl_secs: env_parse("MSGATE_AUTH_CACHE_TTL_SECS", 60),
        },
        build_concurrency,
        build_timeout_secs: env_parse("MSGATE_BUILD_TIMEOUT_SECS", 600),
        start_timeout_secs: env_parse("MSGATE_START_TIMEOUT_SECS", 60),
        stop_timeout_secs: env_parse("MSGATE_STOP_TIMEOUT_SECS", 30),
        restart_timeout_secs: env_parse("MSGATE_RESTART_TIMEOUT_SECS", 60),
        stop_grace_secs: env_parse("MSGATE_STOP_GRACE_SECS", 10),
        forward_timeout_secs: env_parse("MSGATE_FORWARD_TIMEOUT_SECS", 30),
        forward_retries: env_parse("MSGATE_FORWARD_RETRIES", 0),
        reconcile_interval_secs: env_parse("MSGATE_RECONCILE_INTERVAL_SECS", 60),
        dashboard_origin: env_or("MSGATE_DASHBOARD_ORIGIN", &format!("http://localhost:{}", port)),
    })
}
