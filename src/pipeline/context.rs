use std::path::{Path, PathBuf};

/// The files handed to the image build, in archive order.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub files: Vec<(&'static str, Vec<u8>)>,
}

impl BuildContext {
    pub fn new(manifest: &serde_json::Value, code: &str, recipe: String) -> serde_json::Result<Self> {
        Ok(Self {
            files: vec![
                ("package.json", serde_json::to_vec_pretty(manifest)?),
                ("index.js", code.trim().as_bytes().to_vec()),
                ("Dockerfile", recipe.into_bytes()),
            ],
        })
    }

    /// Write every file into `{root}/{dir_name}`, creating it if needed.
    pub async fn write_to(&self, root: &Path, dir_name: &str) -> std::io::Result<PathBuf> {
        let dir = root.join(dir_name);
        tokio::fs::create_dir_all(&dir).await?;
        for (name, content) in &self.files {
            tokio::fs::write(dir.join(name), content).await?;
        }
        Ok(dir)
    }

    /// Pack the files as an uncompressed tar archive.
    pub fn to_tar(&self) -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name)?;
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_slice())?;
        }
        builder.into_inner()
    }
}
