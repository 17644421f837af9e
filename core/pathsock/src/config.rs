//! Connection configuration
//!
//! [`Config`] holds the plain knobs and can come from JSON or the
//! environment. [`Options`] adds the collaborators and callbacks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::candidate::Candidate;
use crate::error::Error;
use crate::key::NodePublic;
use crate::netcheck::{NetChecker, NetInfo, NoopNetChecker, NoopPortMapper, PortMapper};
use crate::relay::{NoRelayDialer, RelayDialer};

/// Plain configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred UDP port; 0 picks one
    pub port: u16,
    /// Log every disco message at info
    pub debug_disco: bool,
    /// Never bind UDP; everything goes via relay
    pub always_use_relay: bool,
    /// Don't advertise local interface addresses
    pub omit_local_addrs: bool,
    /// Always dial a peer's home relay instead of reusing the region it
    /// was last heard on
    pub disable_relay_route: bool,
    /// Log the idle check behind every periodic re-STUN decision
    pub restun_stop_on_idle: bool,
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read `PATHSOCK_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let flag = |name: &str| -> Result<bool, Error> {
            match lookup(name).as_deref() {
                None | Some("") => Ok(false),
                Some("1") | Some("true") => Ok(true),
                Some("0") | Some("false") => Ok(false),
                Some(other) => Err(Error::Config(format!("{}: invalid bool {:?}", name, other))),
            }
        };
        let port = match lookup("PATHSOCK_PORT").as_deref() {
            None | Some("") => 0,
            Some(s) => s
                .parse()
                .map_err(|_| Error::Config(format!("PATHSOCK_PORT: invalid port {:?}", s)))?,
        };
        Ok(Self {
            port,
            debug_disco: flag("PATHSOCK_DEBUG_DISCO")?,
            always_use_relay: flag("PATHSOCK_ALWAYS_USE_RELAY")?,
            omit_local_addrs: flag("PATHSOCK_OMIT_LOCAL_ADDRS")?,
            disable_relay_route: flag("PATHSOCK_DISABLE_RELAY_ROUTE")?,
            restun_stop_on_idle: flag("PATHSOCK_RESTUN_STOP_ON_IDLE")?,
        })
    }
}

/// Called with the new self endpoints whenever they change
pub type EndpointsFn = Arc<dyn Fn(&[Candidate]) + Send + Sync>;
/// Called when a relay connection is added or removed
pub type RelayActiveFn = Arc<dyn Fn() + Send + Sync>;
/// How long the data plane has been idle
pub type IdleFn = Arc<dyn Fn() -> Duration + Send + Sync>;
/// Called (throttled) when a peer sends us something
pub type NoteRecvActivityFn = Arc<dyn Fn(NodePublic) + Send + Sync>;
/// Called when network conditions change
pub type NetInfoFn = Arc<dyn Fn(&NetInfo) + Send + Sync>;

/// Everything needed to construct a [`crate::Conn`]
#[derive(Clone)]
pub struct Options {
    pub config: Config,
    pub net_checker: Arc<dyn NetChecker>,
    pub port_mapper: Arc<dyn PortMapper>,
    pub relay_dialer: Arc<dyn RelayDialer>,
    pub endpoints_fn: Option<EndpointsFn>,
    pub relay_active_fn: Option<RelayActiveFn>,
    pub idle_fn: Option<IdleFn>,
    pub note_recv_activity: Option<NoteRecvActivityFn>,
    pub net_info_fn: Option<NetInfoFn>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: Config::default(),
            net_checker: Arc::new(NoopNetChecker),
            port_mapper: Arc::new(NoopPortMapper),
            relay_dialer: Arc::new(NoRelayDialer),
            endpoints_fn: None,
            relay_active_fn: None,
            idle_fn: None,
            note_recv_activity: None,
            net_info_fn: None,
        }
    }
}

impl Options {
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("config", &self.config)
            .field("endpoints_fn", &self.endpoints_fn.is_some())
            .field("idle_fn", &self.idle_fn.is_some())
            .finish_non_exhaustive()
    }
}
