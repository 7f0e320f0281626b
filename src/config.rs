use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, fmt};

use ocean_core::prelude::*;
use serde::Deserialize;

use crate::loops::LoopConfig;
use crate::types::{Catalog, PlanTypeEntry, RegionEntry};
use crate::{provider, serdes};

/// Fully-resolved runtime configuration.
pub struct Config {
	pub api_addr: SocketAddr,
	pub bearer_token: String,
	pub domain: String,
	pub state_dir: PathBuf,
	/// Forwarder config files land here.
	pub config_dir: PathBuf,
	pub log_dir: PathBuf,
	pub nginx_conf_dir: PathBuf,
	pub forwarder_bin: PathBuf,
	pub probe_url: String,
	pub probe_delay: Duration,
	pub stop_grace: Duration,
	pub provider_timeout: Duration,
	pub saga_timeout: Duration,
	pub loops: LoopConfig,
	pub vendor_a: Option<provider::vendor_a::Config>,
	pub vendor_b: Option<provider::vendor_b::Config>,
	pub catalog: Catalog,
}

impl fmt::Debug for Config {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Config")
			.field("api_addr", &self.api_addr)
			.field("domain", &self.domain)
			.field("state_dir", &self.state_dir)
			.field("nginx_conf_dir", &self.nginx_conf_dir)
			.finish_non_exhaustive()
	}
}

/// The config file wraps everything under a top-level `config:` key.
#[derive(Debug, Default, Deserialize)]
pub struct NestedRawConfig {
	config: Option<RawConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	api_addr: Option<String>,
	bearer_token: Option<String>,
	domain: Option<String>,
	state_dir: Option<PathBuf>,
	config_dir: Option<PathBuf>,
	log_dir: Option<PathBuf>,
	nginx_conf_dir: Option<PathBuf>,
	forwarder_bin: Option<PathBuf>,
	probe_url: Option<String>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	probe_delay: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	stop_grace: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	provider_timeout: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	saga_timeout: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	sweep_interval: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	recovery_interval: Option<Duration>,
	#[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
	health_interval: Option<Duration>,
	/// Global bounds every plan-type port range must fall inside.
	start_port: Option<u16>,
	end_port: Option<u16>,
	providers: Option<RawProviders>,
	#[serde(default)]
	plan_types: Vec<PlanTypeEntry>,
	#[serde(default)]
	regions: Vec<RegionEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProviders {
	vendor_a: Option<provider::vendor_a::Config>,
	vendor_b: Option<provider::vendor_b::Config>,
}

pub fn parse_config(contents: String) -> anyhow::Result<Config> {
	let nested: NestedRawConfig = if contents.trim().is_empty() {
		NestedRawConfig::default()
	} else {
		serdes::yamlviajson::from_str(&contents)?
	};
	let raw = nested.config.unwrap_or_default();

	let api_addr = parse::<String>("API_ADDR")?
		.or(raw.api_addr)
		.unwrap_or_else(|| "0.0.0.0:9090".to_string())
		.parse::<SocketAddr>()
		.context("API_ADDR must be host:port")?;
	let bearer_token = parse::<String>("BEARER_TOKEN")?
		.or(raw.bearer_token)
		.unwrap_or_default();
	if bearer_token.is_empty() {
		warn!("no bearer token configured; API authentication is disabled");
	}
	let domain = parse::<String>("DOMAIN")?
		.or(raw.domain)
		.unwrap_or_else(|| "example.io".to_string());

	let state_dir = parse::<PathBuf>("STATE_DIR")?
		.or(raw.state_dir)
		.unwrap_or_else(|| PathBuf::from("/var/lib/oceanproxy"));
	let config_dir = parse::<PathBuf>("CONFIG_DIR")?
		.or(raw.config_dir)
		.unwrap_or_else(|| PathBuf::from("/etc/oceanproxy"));
	let log_dir = parse::<PathBuf>("LOG_DIR")?
		.or(raw.log_dir)
		.unwrap_or_else(|| PathBuf::from("/var/log/oceanproxy"));
	let nginx_conf_dir = parse::<PathBuf>("NGINX_CONF_DIR")?
		.or(raw.nginx_conf_dir)
		.unwrap_or_else(|| PathBuf::from("/etc/nginx/conf.d/oceanproxy"));
	let forwarder_bin = parse::<PathBuf>("FORWARDER_BIN")?
		.or(raw.forwarder_bin)
		.unwrap_or_else(|| PathBuf::from("/usr/bin/3proxy"));

	// Backstop bounds: a catalog entry outside them is a config mistake.
	let start_port = parse::<u16>("START_PORT")?.or(raw.start_port).unwrap_or(10000);
	let end_port = parse::<u16>("END_PORT")?.or(raw.end_port).unwrap_or(39999);
	for entry in &raw.plan_types {
		if entry.port_start < start_port || entry.port_end > end_port {
			anyhow::bail!(
				"plan type {} range {}-{} falls outside the global port bounds {}-{}",
				entry.key(),
				entry.port_start,
				entry.port_end,
				start_port,
				end_port
			);
		}
	}
	let catalog = Catalog::new(raw.plan_types, raw.regions)?;
	if catalog.is_empty() {
		warn!("no plan types configured; plan creation will be rejected");
	}

	let mut providers = raw.providers.unwrap_or_default();
	if let Some(key) = parse::<String>("VENDOR_A_API_KEY")? {
		if let Some(cfg) = providers.vendor_a.as_mut() {
			cfg.api_key = key;
		}
	}
	if let Some(key) = parse::<String>("VENDOR_B_API_KEY")? {
		if let Some(cfg) = providers.vendor_b.as_mut() {
			cfg.api_key = key;
		}
	}

	let loops = LoopConfig {
		sweep_interval: raw.sweep_interval.unwrap_or(Duration::from_secs(60)),
		recovery_interval: raw.recovery_interval.unwrap_or(Duration::from_secs(10)),
		health_interval: raw.health_interval.unwrap_or(Duration::from_secs(30)),
		..LoopConfig::default()
	};

	Ok(Config {
		api_addr,
		bearer_token,
		domain,
		state_dir,
		config_dir,
		log_dir,
		nginx_conf_dir,
		forwarder_bin,
		probe_url: raw
			.probe_url
			.unwrap_or_else(|| "http://api.ipify.org".to_string()),
		probe_delay: raw.probe_delay.unwrap_or(Duration::from_secs(2)),
		stop_grace: raw.stop_grace.unwrap_or(Duration::from_secs(5)),
		provider_timeout: parse_duration("PROVIDER_TIMEOUT")?
			.or(raw.provider_timeout)
			.unwrap_or(Duration::from_secs(30)),
		saga_timeout: raw.saga_timeout.unwrap_or(Duration::from_secs(60)),
		loops,
		vendor_a: providers.vendor_a,
		vendor_b: providers.vendor_b,
		catalog,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(|v| Some(v))
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?
		.map(|ds| {
			duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, ds, e))
		})
		.transpose()
}
