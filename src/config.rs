#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // base (path or absolute url) that rewritten manifests point their
    // proxied uris at. leave the default unless the proxy sits behind a
    // path-rewriting load balancer
    #[clap(long, env, default_value = "/api/v1/proxy")]
    pub proxy_base: String,

    // external service that decrypts megaup media payloads
    #[clap(long, env)]
    pub decode_service_url: String,

    // this should be either * for allowing everything, or a comma seperated
    // list of domains like example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            proxy_base: "/api/v1/proxy".to_string(),
            decode_service_url: "http://localhost:8787/decode".to_string(),
            cors_origin: "*".to_string(),
            sentry_dsn: None,
        }
    }
}
