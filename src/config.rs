use anyhow::{anyhow, Result};

const SENTINEL_SECRET: &str = "change this before running";

/// Bridge configuration, loaded from environment variables at startup.
///
/// Mirrors spec.md §6 field-for-field. Loading is the single fallible point
/// before any listener binds: a bad config is a fatal error, not a retry.
#[derive(Debug, Clone)]
pub struct Config {
    pub unique_secret_key: String,
    pub matrix_homeserver_url: String,
    pub matrix_homeserver_domain: String,
    pub matrix_botname: String,
    pub matrix_appservice_port: u16,
    pub matrix_appservice_token: String,
    pub matrix_homeserver_token: String,
    pub gitter_login_port: u16,
    pub gitter_login_url: String,
    pub gitter_oauth_key: String,
    pub gitter_oauth_secret: String,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let unique_secret_key = require_env("UNIQUE_SECRET_KEY")?;
        if unique_secret_key.is_empty() || unique_secret_key == SENTINEL_SECRET {
            return Err(anyhow!(
                "UNIQUE_SECRET_KEY must be set to a real secret, not the sentinel default"
            ));
        }

        let mut matrix_homeserver_url = require_env("MATRIX_HOMESERVER_URL")?;
        if !matrix_homeserver_url.ends_with('/') {
            matrix_homeserver_url.push('/');
        }

        let mut gitter_login_url = require_env("GITTER_LOGIN_URL")?;
        if !gitter_login_url.ends_with('/') {
            gitter_login_url.push('/');
        }

        Ok(Config {
            unique_secret_key,
            matrix_homeserver_url,
            matrix_homeserver_domain: require_env("MATRIX_HOMESERVER_DOMAIN")?,
            matrix_botname: require_env("MATRIX_BOTNAME")?,
            matrix_appservice_port: require_env("MATRIX_APPSERVICE_PORT")?.parse()?,
            matrix_appservice_token: require_env("MATRIX_APPSERVICE_TOKEN")?,
            matrix_homeserver_token: require_env("MATRIX_HOMESERVER_TOKEN")?,
            gitter_login_port: require_env("GITTER_LOGIN_PORT")?.parse()?,
            gitter_login_url,
            gitter_oauth_key: require_env("GITTER_OAUTH_KEY")?,
            gitter_oauth_secret: require_env("GITTER_OAUTH_SECRET")?,
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "database.sqlite3".to_string()),
        })
    }

    /// Fully-qualified Matrix id of the bridge bot, e.g. `@gitterbot:example.org`.
    pub fn bot_fullname(&self) -> String {
        format!("@{}:{}", self.matrix_botname, self.matrix_homeserver_domain)
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("{} must be set", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_all_required() {
        std::env::set_var("UNIQUE_SECRET_KEY", "a-real-secret");
        std::env::set_var("MATRIX_HOMESERVER_URL", "https://matrix.example.org");
        std::env::set_var("MATRIX_HOMESERVER_DOMAIN", "example.org");
        std::env::set_var("MATRIX_BOTNAME", "gitterbot");
        std::env::set_var("MATRIX_APPSERVICE_PORT", "9000");
        std::env::set_var("MATRIX_APPSERVICE_TOKEN", "as_token");
        std::env::set_var("MATRIX_HOMESERVER_TOKEN", "hs_token");
        std::env::set_var("GITTER_LOGIN_PORT", "9001");
        std::env::set_var("GITTER_LOGIN_URL", "https://bridge.example.org");
        std::env::set_var("GITTER_OAUTH_KEY", "key");
        std::env::set_var("GITTER_OAUTH_SECRET", "secret");
    }

    #[test]
    fn normalizes_trailing_slashes() {
        set_all_required();
        let cfg = Config::from_env().unwrap();
        assert!(cfg.matrix_homeserver_url.ends_with('/'));
        assert!(cfg.gitter_login_url.ends_with('/'));
        assert_eq!(cfg.bot_fullname(), "@gitterbot:example.org");
    }

    #[test]
    fn rejects_sentinel_secret() {
        set_all_required();
        std::env::set_var("UNIQUE_SECRET_KEY", SENTINEL_SECRET);
        assert!(Config::from_env().is_err());
    }
}
