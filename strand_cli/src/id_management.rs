use crate::error::CliError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strand_p2p::HostIdentity;

/// The identities stored in the identity file, keyed by name.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LocalIdentitySet {
    pub identities: BTreeMap<String, HostIdentity>,
}

impl LocalIdentitySet {
    pub fn try_load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, CliError> {
        let ids = load_config_file(path)?;
        Ok(ids)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CliError> {
        save_config_file(path, self)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&HostIdentity> {
        self.identities.get(name)
    }

    /// Stores `identity` under its own name.
    pub fn insert(&mut self, identity: HostIdentity) -> Option<HostIdentity> {
        self.identities.insert(identity.name().to_string(), identity)
    }

    pub fn remove<S: AsRef<str>>(&mut self, name: S) -> Option<HostIdentity> {
        self.identities.remove(name.as_ref())
    }

    /// The named identity, or the first one when no name is given.
    pub fn select(&self, name: Option<&str>) -> Option<&HostIdentity> {
        match name {
            Some(name) => self.identities.get(name),
            None => self.identities.values().next(),
        }
    }
}

pub fn default_id_path() -> PathBuf {
    let mut home = std::env::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.push(".strand");
    home.push("config.yml");
    home
}

pub fn load_config_file<P: AsRef<Path>>(path: Option<P>) -> Result<LocalIdentitySet, CliError> {
    let path = path.map(|p| p.as_ref().to_path_buf()).unwrap_or_else(default_id_path);
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let local_peer_set: LocalIdentitySet = serde_yml::from_reader(reader)?;
    if let Some(bad) = local_peer_set.identities.values().find(|id| !id.check()) {
        return Err(CliError::InconsistentIdentity(bad.name().to_string()));
    }
    Ok(local_peer_set)
}

pub fn save_config_file<P: AsRef<Path>>(path: P, ids: &LocalIdentitySet) -> Result<(), CliError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    serde_yml::to_writer(writer, ids)?;
    Ok(())
}
