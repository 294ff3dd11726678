use libp2p::identity::{Keypair, PublicKey};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::path::Path;
use thiserror::Error;

/// The identity a host runs under: a human-readable name, an ed25519 keypair and the peer id derived from it.
#[derive(Clone, Serialize, Deserialize)]
pub struct HostIdentity {
    name: String,
    #[serde(with = "keypair_hex")]
    keypair: Keypair,
    #[serde(with = "peer_base58")]
    peer_id: PeerId,
}

impl HostIdentity {
    /// Create a new identity with the given name and a fresh keypair.
    /// The peer id is derived from the public key.
    pub fn random_with_name<S: Into<String>>(name: S) -> Self {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        HostIdentity { name: name.into(), keypair, peer_id }
    }

    /// Create a new identity with a random name and keypair.
    pub fn random() -> Self {
        Self::random_with_name(random_name())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IdentityError> {
        let text = self.to_yml()?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn to_yml(&self) -> Result<String, IdentityError> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let text = std::fs::read_to_string(path)?;
        let identity: HostIdentity = serde_yml::from_str(&text)?;
        if !identity.check() {
            return Err(IdentityError::Inconsistent(identity.name));
        }
        Ok(identity)
    }

    /// Return an internal consistency check, that the Peer Id corresponds to the public key.
    pub fn check(&self) -> bool {
        self.peer_id == self.keypair.public().to_peer_id()
    }
}

impl Display for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.peer_id)
    }
}

impl Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostIdentity({self})")
    }
}

impl PartialEq for HostIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.keypair.public() == other.keypair.public() && self.peer_id == other.peer_id
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Error reading/writing identity: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error de/encoding identity: {0}")]
    Serde(#[from] serde_yml::Error),
    #[error("The peer id of identity '{0}' does not match its keypair.")]
    Inconsistent(String),
}

/// What a host tells other peers about itself: who it is, where it can be reached and the key that proves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
    /// Protobuf-encoded public key.
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
}

impl PeerInfo {
    pub fn new(identity: &HostIdentity, addrs: Vec<Multiaddr>) -> Self {
        PeerInfo { id: identity.peer_id(), addrs, public_key: identity.public_key().encode_protobuf() }
    }

    /// Checks that the advertised public key decodes and derives the advertised peer id.
    pub fn verify(&self) -> bool {
        match PublicKey::try_decode_protobuf(&self.public_key) {
            Ok(key) => key.to_peer_id() == self.id,
            Err(_) => false,
        }
    }
}

const FUNNY_ADJECTIVES: [&str; 20] = [
    "Wacky", "Zany", "Quirky", "Goofy", "Silly", "Nutty", "Loony", "Whimsical", "Red", "Fishy", "Freaky", "Kooky",
    "Odd", "Stretchy", "Droll", "Jovial", "Playful", "Spicy", "Witty", "Zesty",
];

const AMUSING_NOUNS: [&str; 20] = [
    "Banana", "Noodle", "Pickle", "Wombat", "Giraffe", "Penguin", "Platypus", "Unicorn", "Muffin", "Taco", "Burrito",
    "Pudding", "Jellybean", "Lollipop", "Pizza", "Cucumber", "Pumpkin", "Turnip", "Carrot", "Parsnip",
];

fn random_name() -> String {
    let i = rand::random_range(0..FUNNY_ADJECTIVES.len());
    let j = rand::random_range(0..AMUSING_NOUNS.len());
    format!("{}{}", FUNNY_ADJECTIVES[i], AMUSING_NOUNS[j])
}

/// Ed25519 keypairs as the hex of their 64-byte `secret || public` encoding.
mod keypair_hex {
    use libp2p::identity::Keypair;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Keypair, s: S) -> Result<S::Ok, S::Error> {
        let pair = key.clone().try_into_ed25519().map_err(S::Error::custom)?;
        s.serialize_str(&hex::encode(pair.to_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Keypair, D::Error> {
        let mut bytes = hex::decode(String::deserialize(d)?).map_err(D::Error::custom)?;
        if bytes.len() != 64 {
            return Err(D::Error::custom(format!("expected 64 keypair bytes, got {}", bytes.len())));
        }
        let (secret, public) = bytes.split_at_mut(32);
        let public = public.to_vec();
        let keypair = Keypair::ed25519_from_bytes(secret).map_err(D::Error::custom)?;
        let derived = keypair.public().try_into_ed25519().map_err(D::Error::custom)?.to_bytes();
        if derived[..] != public[..] {
            return Err(D::Error::custom("the stored public key does not belong to the secret key"));
        }
        Ok(keypair)
    }
}

mod peer_base58 {
    use libp2p::PeerId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &PeerId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&id.to_base58())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PeerId, D::Error> {
        String::deserialize(d)?.parse().map_err(serde::de::Error::custom)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
