/***************************************************************************************************
Configuration abstractions for a node: reading pool membership/sizing from
an INI file, and initializing logging.

Values are read from the ini into the environment once at startup
(`initialize_ini`), then pulled back out as typed values via
`mc_utils::ini::env2var`/`env2var_vec` — `pbft_core` never holds onto a
`tini::Ini` handle anywhere in its own state.
***************************************************************************************************/

use std::collections::HashMap;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};

use crate::collab::{Crypto, PoolConfig};
use crate::ids::NodeName;

/// Reads `pool.ini` into the process environment. Per-node public keys are
/// named under a `[keys]` section (`node_name = path/to/key/file`) and are
/// pulled in as base64, matching `mc_utils::ini::ini2env_binfiledata`'s
/// convention for binary ini-referenced files.
pub fn initialize_ini(path: &str) {
    let ini = mc_utils::ini::get_ini(path);
    mc_utils::ini::ini2env("pool", "n", &ini, None);
    mc_utils::ini::ini2env("pool", "self_name", &ini, None);
    mc_utils::ini::ini2env("pool", "names", &ini, None);
    mc_utils::ini::ini2env("log", "debug", &ini, None);

    let names: Vec<String> = mc_utils::ini::env2var_vec("pool.names");
    for name in &names {
        let exp_key = format!("keys.{}", name);
        mc_utils::ini::ini2env_binfiledata("keys", name, &ini, &exp_key);
    }
}

/// A `PoolConfig` populated from the environment variables `initialize_ini`
/// leaves behind. Built once at startup and handed to `Node::new` as a
/// `Box<dyn PoolConfig>`.
#[derive(Debug, Clone)]
pub struct IniPoolConfig {
    n: u32,
    self_name: NodeName,
    names: Vec<NodeName>,
    public_keys: HashMap<NodeName, Vec<u8>>,
}

impl IniPoolConfig {
    /// Reads `n`, `self_name`, `names` and every name's public key from the
    /// environment populated by `initialize_ini`.
    pub fn from_env() -> Self {
        let n: u32 = mc_utils::ini::env2var("pool.n");
        let self_name = NodeName::new(mc_utils::ini::env2var::<String>("pool.self_name"));
        let names: Vec<NodeName> = mc_utils::ini::env2var_vec::<String>("pool.names")
            .into_iter()
            .map(NodeName::new)
            .collect();

        let mut public_keys = HashMap::with_capacity(names.len());
        for name in &names {
            let exp_key = format!("keys.{}", name.0);
            let b64: String = mc_utils::ini::env2var(&exp_key);
            let bytes = base64::decode(&b64).expect("public key is not valid base64");
            public_keys.insert(name.clone(), bytes);
        }

        IniPoolConfig {
            n,
            self_name,
            names,
            public_keys,
        }
    }
}

impl PoolConfig for IniPoolConfig {
    fn n(&self) -> u32 {
        self.n
    }

    fn self_name(&self) -> &NodeName {
        &self.self_name
    }

    fn all_names(&self) -> &[NodeName] {
        &self.names
    }

    fn public_key(&self, name: &NodeName) -> Option<&[u8]> {
        self.public_keys.get(name).map(|v| v.as_slice())
    }
}

/// Production `Crypto` collaborator: PEM keys signed and verified via
/// `openssl`, through `mc_utils::crypto::{sign, valid_sig}`. Public keys
/// are taken from the `PoolConfig` this node was built with, so `verify`
/// can reject a signature from an unknown or unlisted peer.
pub struct OpensslCrypto {
    private_key_pem: Vec<u8>,
    public_keys: HashMap<NodeName, PKey<Public>>,
}

impl OpensslCrypto {
    /// `private_key_pem` is this node's own signing key. Peer public keys
    /// are parsed once, up front, from whatever `pool` reports for each
    /// name; a name whose bytes don't parse as a PEM public key is simply
    /// left unable to verify (`verify` then returns `false` for it).
    pub fn new(private_key_pem: Vec<u8>, pool: &dyn PoolConfig) -> Self {
        let mut public_keys = HashMap::with_capacity(pool.all_names().len());
        for name in pool.all_names() {
            if let Some(raw) = pool.public_key(name) {
                if let Ok(pkey) = PKey::public_key_from_pem(raw) {
                    public_keys.insert(name.clone(), pkey);
                }
            }
        }
        OpensslCrypto {
            private_key_pem,
            public_keys,
        }
    }
}

impl Crypto for OpensslCrypto {
    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        mc_utils::crypto::sign(bytes, None, &self.private_key_pem, MessageDigest::sha256())
    }

    fn verify(&self, who: &NodeName, bytes: &[u8], sig: &[u8]) -> bool {
        match self.public_keys.get(who) {
            Some(pkey) => mc_utils::crypto::valid_sig(bytes, None, sig, pkey, MessageDigest::sha256()),
            None => false,
        }
    }
}

/// Sets up console + (optionally) file logging, gated on `log.debug` in the
/// environment. Targets follow this crate's `log::debug!(target: "...")`
/// conventions in `node.rs`/`elector.rs`/`monitor.rs`/`suspicion.rs`.
pub fn initialize_logging() {
    let stdout = ConsoleAppender::builder().build();

    let mut config =
        Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));

    let debug_enabled: bool = mc_utils::ini::env2var("log.debug");
    if debug_enabled {
        let log_node = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
            .append(false)
            .build("log/debug_node.log")
            .unwrap();
        let log_elector = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
            .append(false)
            .build("log/debug_elector.log")
            .unwrap();
        let log_monitor = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new("{l} - {m}{n}")))
            .append(false)
            .build("log/debug_monitor.log")
            .unwrap();

        config = config
            .appender(Appender::builder().build("log_node", Box::new(log_node)))
            .appender(Appender::builder().build("log_elector", Box::new(log_elector)))
            .appender(Appender::builder().build("log_monitor", Box::new(log_monitor)))
            .logger(
                Logger::builder()
                    .appender("log_node")
                    .additive(false)
                    .build("node", LevelFilter::Debug),
            )
            .logger(
                Logger::builder()
                    .appender("log_elector")
                    .additive(false)
                    .build("elector", LevelFilter::Debug),
            )
            .logger(
                Logger::builder()
                    .appender("log_monitor")
                    .additive(false)
                    .build("monitor", LevelFilter::Debug),
            );
    }

    let config = config
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .unwrap();

    log4rs::init_config(config).unwrap();
}
