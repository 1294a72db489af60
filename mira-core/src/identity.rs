//! Device identity: hardware-address-shaped device id, persistent
//! instance id, and the long-term Ed25519 signing key.
//!
//! Persisted values live in a [`KeyValueStore`]. A missing key means
//! "not generated yet"; generation happens once under a lock so
//! concurrent first callers observe the same value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info, warn};

use crate::error::MiraError;

const KEY_INSTANCE_ID: &str = "instance-id";
const KEY_PUBLIC_KEY: &str = "signing-public-key";
const KEY_PRIVATE_KEY: &str = "signing-private-key";

// ── KeyValueStore ────────────────────────────────────────────────

/// Durable string key-value storage for identity material.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, MiraError>;
    fn set(&self, key: &str, value: &str) -> Result<(), MiraError>;
}

/// Volatile store, for tests and ephemeral receivers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, MiraError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), MiraError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON file store. Every `set` rewrites the file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MiraError> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(MiraError::Store(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, MiraError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), MiraError> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        let text = serde_json::to_string_pretty(&*values)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| MiraError::Store(format!("{}: {e}", dir.display())))?;
        }
        write_private(&self.path, text.as_bytes())
            .map_err(|e| MiraError::Store(format!("{}: {e}", self.path.display())))
    }
}

/// Replace `path` atomically with an owner-only file: write a sibling
/// temp file, sync it, then rename over the target.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

// ── Device id ────────────────────────────────────────────────────

/// Hardware address of the primary physical interface, if readable.
pub fn hardware_address() -> Option<[u8; 6]> {
    hardware_address_in(Path::new("/sys/class/net"))
}

/// Scan a sysfs-style interface directory. Only interfaces backed by a
/// device count; bridges, veth pairs and tunnels have no `device` link
/// and their addresses change when they are recreated.
pub fn hardware_address_in(root: &Path) -> Option<[u8; 6]> {
    let entries = std::fs::read_dir(root).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| root.join(n).join("device").exists())
        .collect();
    names.sort();

    names.iter().find_map(|name| {
        let text = std::fs::read_to_string(root.join(name).join("address")).ok()?;
        parse_mac(text.trim()).filter(|mac| mac.iter().any(|&b| b != 0))
    })
}

/// Host-name derived address with one random byte and the
/// locally-administered bit set.
pub fn fallback_address(host_name: &str) -> [u8; 6] {
    let hash = blake3::hash(host_name.as_bytes());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&hash.as_bytes()[..6]);
    mac[5] ^= (OsRng.next_u32() & 0xFF) as u8;
    mac[0] = (mac[0] | 0x02) & 0xFE;
    mac
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

// ── DeviceIdentity ───────────────────────────────────────────────

/// Process-wide identity, shared by the responder and the advertiser.
pub struct DeviceIdentity {
    store: Arc<dyn KeyValueStore>,
    device_id: String,
    instance_id: Mutex<Option<String>>,
    signing_key: Mutex<Option<SigningKey>>,
}

impl DeviceIdentity {
    /// Resolve the device id now and defer persisted values to first use.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let mac = hardware_address().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "mira".to_string());
            warn!("no hardware address available; deriving device id from {host}");
            fallback_address(&host)
        });
        Self::with_device_id(store, format_mac(&mac))
    }

    /// Use an explicit device id instead of probing interfaces.
    pub fn with_device_id(store: Arc<dyn KeyValueStore>, device_id: String) -> Self {
        Self {
            store,
            device_id,
            instance_id: Mutex::new(None),
            signing_key: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Persistent instance id, generated on first call.
    pub fn instance_id(&self) -> Result<String, MiraError> {
        let mut cached = self.instance_id.lock();
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.store.get(KEY_INSTANCE_ID)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string().to_uppercase();
                self.store.set(KEY_INSTANCE_ID, &id)?;
                info!(instance_id = %id, "generated instance id");
                id
            }
        };
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Long-term signing key, generated and persisted on first call.
    pub fn signing_key(&self) -> Result<SigningKey, MiraError> {
        let mut cached = self.signing_key.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.store.get(KEY_PRIVATE_KEY)? {
            Some(hex_key) => {
                let bytes: [u8; 32] = hex::decode(&hex_key)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| MiraError::Store("corrupt signing key".into()))?;
                debug!("loaded signing key");
                SigningKey::from_bytes(&bytes)
            }
            None => {
                let key = SigningKey::generate(&mut OsRng);
                self.store
                    .set(KEY_PUBLIC_KEY, &hex::encode(key.verifying_key().to_bytes()))?;
                self.store.set(KEY_PRIVATE_KEY, &hex::encode(key.to_bytes()))?;
                info!("generated signing key");
                key
            }
        };
        *cached = Some(key.clone());
        Ok(key)
    }

    pub fn public_key(&self) -> Result<VerifyingKey, MiraError> {
        Ok(self.signing_key()?.verifying_key())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────
