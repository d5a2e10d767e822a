use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::calendar::ResetAnchor;
use crate::limits::*;
use crate::model::{Day, Resource, WeekLayout};

/// Startup options, read once from `WEEKDESK_*` environment variables.
///
/// The day list, resource list and reset anchor are deployment-time settings:
/// changing them takes a restart, and replayed bookings for slots that no
/// longer exist are dropped.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    /// `None` runs without a WAL.
    pub data_dir: Option<PathBuf>,
    pub compact_threshold: u64,
    pub layout: WeekLayout,
    pub reset_anchor: ResetAnchor,
    pub date_labels: bool,
    pub directory: HashMap<String, String>,
    pub name_ttl: Duration,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(key: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Unset keys take defaults; set but
    /// malformed keys are errors.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let in_memory = parse_bool(&get, "WEEKDESK_IN_MEMORY", false)?;
        let data_dir = (!in_memory).then(|| {
            PathBuf::from(get("WEEKDESK_DATA_DIR").unwrap_or_else(|| "./data".into()))
        });

        let days = match get("WEEKDESK_DAYS") {
            Some(raw) => parse_days(&raw)?,
            None => Day::ALL.to_vec(),
        };
        let resources = match get("WEEKDESK_RESOURCES") {
            Some(raw) => parse_resources(&raw)?,
            None => WeekLayout::reference().resources().to_vec(),
        };

        let offset: i32 = parse_or(&get, "WEEKDESK_RESET_UTC_OFFSET", 0)?;
        let anchor_raw = get("WEEKDESK_RESET_ANCHOR").unwrap_or_else(|| "sunday@18".into());
        let reset_anchor = ResetAnchor::parse(&anchor_raw, offset).ok_or_else(|| {
            ConfigError::new(
                "WEEKDESK_RESET_ANCHOR",
                format!("expected <weekday>@<hour> with offset in ±23h, got {anchor_raw:?}"),
            )
        })?;

        let directory = match get("WEEKDESK_DIRECTORY") {
            Some(raw) => parse_directory(&raw)?,
            None => HashMap::new(),
        };

        let metrics_port = match get("WEEKDESK_METRICS_PORT") {
            Some(raw) => Some(raw.trim().parse().map_err(|_| {
                ConfigError::new("WEEKDESK_METRICS_PORT", format!("not a port: {raw:?}"))
            })?),
            None => None,
        };

        Ok(Self {
            bind: get("WEEKDESK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "WEEKDESK_PORT", 5433)?,
            max_connections: parse_or(&get, "WEEKDESK_MAX_CONNECTIONS", 256)?,
            data_dir,
            compact_threshold: parse_or(&get, "WEEKDESK_COMPACT_THRESHOLD", 1000)?,
            layout: WeekLayout::new(days, resources),
            reset_anchor,
            date_labels: parse_bool(&get, "WEEKDESK_DATE_LABELS", true)?,
            directory,
            name_ttl: Duration::from_secs(parse_or(&get, "WEEKDESK_NAME_TTL_SECS", 3600)?),
            metrics_port,
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::new(key, format!("cannot parse {raw:?}"))),
        None => Ok(default),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::new(key, format!("expected a boolean, got {raw:?}"))),
    }
}

/// `Monday,Wednesday,Friday` → ordered, duplicate-free weekdays.
pub fn parse_days(raw: &str) -> Result<Vec<Day>, ConfigError> {
    const KEY: &str = "WEEKDESK_DAYS";
    let mut days = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = Day::parse(part)
            .ok_or_else(|| ConfigError::new(KEY, format!("unknown weekday {part:?}")))?;
        if days.contains(&day) {
            return Err(ConfigError::new(KEY, format!("{day} listed twice")));
        }
        days.push(day);
    }
    if days.is_empty() {
        return Err(ConfigError::new(KEY, "no days"));
    }
    days.sort();
    Ok(days)
}

/// `small_1=Small Room 1,desk_7` → resources in the given order. A missing
/// label defaults to the name.
pub fn parse_resources(raw: &str) -> Result<Vec<Resource>, ConfigError> {
    const KEY: &str = "WEEKDESK_RESOURCES";
    let mut seen = HashSet::new();
    let mut resources = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, label) = match part.split_once('=') {
            Some((n, l)) => (n.trim(), l.trim()),
            None => (part, part),
        };
        if name.is_empty() {
            return Err(ConfigError::new(KEY, format!("empty name in {part:?}")));
        }
        if name.len() > MAX_NAME_LEN || label.len() > MAX_LABEL_LEN {
            return Err(ConfigError::new(KEY, format!("{name:?} name or label too long")));
        }
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::new(KEY, format!("{name:?} listed twice")));
        }
        resources.push(Resource::new(name, if label.is_empty() { name } else { label }));
    }
    if resources.is_empty() {
        return Err(ConfigError::new(KEY, "no resources"));
    }
    if resources.len() > MAX_RESOURCES {
        return Err(ConfigError::new(
            KEY,
            format!("{} resources, limit is {MAX_RESOURCES}", resources.len()),
        ));
    }
    Ok(resources)
}

/// `U1=Ada Lovelace,U2=Grace Hopper`.
pub fn parse_directory(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    const KEY: &str = "WEEKDESK_DIRECTORY";
    let mut names = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (actor, name) = part
            .split_once('=')
            .map(|(a, n)| (a.trim(), n.trim()))
            .filter(|(a, n)| !a.is_empty() && !n.is_empty())
            .ok_or_else(|| ConfigError::new(KEY, format!("expected actor=name, got {part:?}")))?;
        names.insert(actor.to_string(), name.to_string());
    }
    if names.len() > MAX_DIRECTORY_ENTRIES {
        return Err(ConfigError::new(KEY, "too many entries"));
    }
    Ok(names)
}
