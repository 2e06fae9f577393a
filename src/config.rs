// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use crate::lifecycle::LifecycleConfig;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Seconds a reported result waits before it confirms itself.
    pub auto_confirm_seconds: u64,
    /// Seconds between "awaiting confirmation" reminders.
    pub timer_tick_seconds: u64,
    /// Seconds between matchmaking passes.
    pub matchmaking_poll_seconds: u64,
    /// Discord ids granted admin rights at startup.
    pub admin_discord_ids: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:ladder.db?mode=rwc".to_string(),
            port: 3000,
            auto_confirm_seconds: 300,
            timer_tick_seconds: 60,
            matchmaking_poll_seconds: 2,
            admin_discord_ids: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:ladder.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `AUTO_CONFIRM_SECONDS` - confirmation window (default: 300)
    /// - `TIMER_TICK_SECONDS` - reminder interval (default: 60)
    /// - `MATCHMAKING_POLL_SECONDS` - queue poll interval (default: 2)
    /// - `ADMIN_DISCORD_IDS` - comma-separated admin ids
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--database-url <URL>` - Override the database
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a config from CLI args and an env lookup. CLI flags win over
    /// env vars, env vars over defaults.
    pub fn from_sources(args: &[String], env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let database_url = Self::parse_cli_value(args, "--database-url")
            .or_else(|| env("DATABASE_URL"))
            .unwrap_or(defaults.database_url);

        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let admin_discord_ids = env("ADMIN_DISCORD_IDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Config {
            database_url,
            port,
            auto_confirm_seconds: number("AUTO_CONFIRM_SECONDS", defaults.auto_confirm_seconds),
            timer_tick_seconds: number("TIMER_TICK_SECONDS", defaults.timer_tick_seconds),
            matchmaking_poll_seconds: number(
                "MATCHMAKING_POLL_SECONDS",
                defaults.matchmaking_poll_seconds,
            ),
            admin_discord_ids,
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            auto_confirm: Duration::from_secs(self.auto_confirm_seconds),
            tick: Duration::from_secs(self.timer_tick_seconds.max(1)),
        }
    }

    pub fn matchmaking_poll(&self) -> Duration {
        Duration::from_secs(self.matchmaking_poll_seconds.max(1))
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(args: &[&str], env: &[(&str, &str)]) -> Config {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_sources(&args, |key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&["ladder-bot"], &[]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_url, "sqlite:ladder.db?mode=rwc");
        assert_eq!(config.lifecycle(), LifecycleConfig::default());
        assert!(config.admin_discord_ids.is_empty());
    }

    #[test]
    fn test_cli_beats_env() {
        let config = load(&["ladder-bot", "--port", "8080"], &[("PORT", "9000")]);
        assert_eq!(config.port, 8080);
        let config = load(&["ladder-bot"], &[("PORT", "9000")]);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_admin_list_and_windows() {
        let config = load(
            &["ladder-bot"],
            &[
                ("ADMIN_DISCORD_IDS", " 1, 2,,3 "),
                ("AUTO_CONFIRM_SECONDS", "30"),
                ("TIMER_TICK_SECONDS", "0"),
            ],
        );
        assert_eq!(config.admin_discord_ids, vec!["1", "2", "3"]);
        let lc = config.lifecycle();
        assert_eq!(lc.auto_confirm, Duration::from_secs(30));
        assert_eq!(lc.tick, Duration::from_secs(1));
    }

    #[test]
    fn test_bad_numbers_fall_back() {
        let config = load(&["ladder-bot", "--port", "nope"], &[("MATCHMAKING_POLL_SECONDS", "x")]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.matchmaking_poll(), Duration::from_secs(2));
    }
}
