use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub state_dir: PathBuf,
	pub service_name: String,
	pub service_description: String,
	pub cors_origin: Option<String>,
	pub query_timeout: Duration,
	pub load_timeout: Duration,
	pub load_poll_interval: Duration,
	pub evaluate_enabled: bool,
	/// Interpreter command line, split on whitespace; the first token is the program.
	pub evaluator_cmd: Vec<String>,
	pub copy_workers: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 9004)),
			state_dir: PathBuf::from("./state"),
			service_name: "Query Endpoint Server".to_string(),
			service_description: String::new(),
			cors_origin: None,
			query_timeout: Duration::from_secs(30),
			load_timeout: Duration::from_secs(600),
			load_poll_interval: Duration::from_millis(100),
			evaluate_enabled: true,
			evaluator_cmd: vec!["python3".to_string(), "-u".to_string(), "evaluator.py".to_string()],
			copy_workers: 3,
		}
	}
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let defaults = Self::default();
		let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok());
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { std::env::var("HTTP_BIND").unwrap_or_else(|_| defaults.bind.to_string()) };
		let bind: SocketAddr = bind.parse()?;
		let state_dir = std::env::var("STATE_DIR").map(PathBuf::from).unwrap_or(defaults.state_dir);
		let service_name = std::env::var("SERVICE_NAME").unwrap_or(defaults.service_name);
		let service_description = std::env::var("SERVICE_DESCRIPTION").unwrap_or(defaults.service_description);
		let cors_origin = std::env::var("CORS_ORIGIN").ok().filter(|v| !v.trim().is_empty());
		let query_timeout = env_secs("QUERY_TIMEOUT_SECS").unwrap_or(defaults.query_timeout);
		let load_timeout = env_secs("LOAD_TIMEOUT_SECS").unwrap_or(defaults.load_timeout);
		let load_poll_interval = std::env::var("LOAD_POLL_MS").ok().and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(defaults.load_poll_interval);
		let evaluate_enabled = std::env::var("EVALUATE_ENABLED").ok().map(|v| parse_bool(&v)).unwrap_or(defaults.evaluate_enabled);
		let evaluator_cmd = std::env::var("EVALUATOR_CMD").ok().map(|v| split_command(&v)).filter(|v| !v.is_empty()).unwrap_or(defaults.evaluator_cmd);
		let copy_workers = std::env::var("COPY_WORKERS").ok().and_then(|v| v.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(defaults.copy_workers);
		Ok(Self { bind, state_dir, service_name, service_description, cors_origin, query_timeout, load_timeout, load_poll_interval, evaluate_enabled, evaluator_cmd, copy_workers })
	}

	pub fn state_file(&self) -> PathBuf {
		self.state_dir.join("state.ini")
	}

	pub fn query_objects_dir(&self) -> PathBuf {
		self.state_dir.join("query_objects")
	}
}

fn env_secs(key: &str) -> Option<Duration> {
	std::env::var(key).ok().and_then(|v| v.parse::<f64>().ok()).filter(|s| *s > 0.0).map(Duration::from_secs_f64)
}

pub fn parse_bool(raw: &str) -> bool {
	matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

pub fn split_command(raw: &str) -> Vec<String> {
	raw.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_bool_flags() {
		assert!(parse_bool("true"));
		assert!(parse_bool(" On "));
		assert!(parse_bool("1"));
		assert!(!parse_bool("false"));
		assert!(!parse_bool("nope"));
	}

	#[test]
	fn splits_evaluator_command() {
		assert_eq!(split_command("python3  -u  eval.py"), vec!["python3", "-u", "eval.py"]);
		assert!(split_command("   ").is_empty());
	}

	#[test]
	fn derived_paths_live_under_state_dir() {
		let cfg = Config { state_dir: PathBuf::from("/srv/eps"), ..Config::default() };
		assert_eq!(cfg.state_file(), PathBuf::from("/srv/eps/state.ini"));
		assert_eq!(cfg.query_objects_dir(), PathBuf::from("/srv/eps/query_objects"));
	}
}
