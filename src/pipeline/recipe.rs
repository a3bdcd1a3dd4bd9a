/// Container recipe for a single-file Node service.
pub fn render(base_image: &str, internal_port: u16) -> String {
    format!(
        "FROM {base_image}\n\
         WORKDIR /app\n\
         COPY package*.json ./\n\
         RUN npm install --production\n\
         COPY . .\n\
         EXPOSE {internal_port}\n\
         CMD [\"npm\", \"start\"]\n"
    )
}
