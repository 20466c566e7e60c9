//! Durable tunnel registry
//!
//! All records live in one JSON document (`{"tunnels": [...]}`). Every
//! mutation runs under a single async lock: the candidate state is built on a
//! copy, checked for VNI and overlay subnet uniqueness, written to disk
//! atomically (temp file + rename) and only then made visible.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use vxtun_common::{TunnelError, TunnelResult};

use crate::allocator::{Allocation, Allocator};
use crate::types::{overlay_cidr, Tunnel};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    tunnels: Vec<Tunnel>,
}

#[derive(Debug)]
enum Backing {
    Memory,
    File(PathBuf),
}

/// Tunnel record store with write-time uniqueness checks
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: Mutex<Vec<Tunnel>>,
    backing: Backing,
}

impl TunnelRegistry {
    /// A registry that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            tunnels: Mutex::new(Vec::new()),
            backing: Backing::Memory,
        }
    }

    /// Open the registry document at `path`, starting empty if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> TunnelResult<Self> {
        let path = path.into();
        let tunnels = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => {
                let doc: RegistryDocument = serde_json::from_str(&contents).map_err(|e| {
                    TunnelError::storage(format!("parse {}", path.display()), e.to_string())
                })?;
                doc.tunnels
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Registry file absent, starting empty");
                Vec::new()
            }
            Err(e) => {
                return Err(TunnelError::storage(
                    format!("read {}", path.display()),
                    e.to_string(),
                ))
            }
        };

        info!(path = %path.display(), count = tunnels.len(), "Loaded tunnel registry");

        Ok(Self {
            tunnels: Mutex::new(tunnels),
            backing: Backing::File(path),
        })
    }

    /// Path of the backing document, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory => None,
            Backing::File(path) => Some(path),
        }
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.tunnels.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> TunnelResult<Tunnel> {
        self.tunnels
            .lock()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| TunnelError::not_found("Tunnel", id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tunnels.lock().await.iter().any(|t| t.id == id)
    }

    /// Insert a fully formed record
    pub async fn insert(&self, tunnel: Tunnel) -> TunnelResult<Tunnel> {
        let mut tunnels = self.tunnels.lock().await;
        self.commit_insert(&mut tunnels, tunnel).await
    }

    /// Allocate a VNI and insert the record built from it, in one critical section
    pub async fn insert_allocated<F>(&self, allocator: &Allocator, build: F) -> TunnelResult<Tunnel>
    where
        F: FnOnce(Allocation) -> TunnelResult<Tunnel>,
    {
        let mut tunnels = self.tunnels.lock().await;
        let allocation = allocator.allocate(tunnels.iter())?;
        let tunnel = build(allocation)?;
        self.commit_insert(&mut tunnels, tunnel).await
    }

    /// Read-modify-write of one record
    ///
    /// The mutated record is re-validated and re-checked for uniqueness.
    pub async fn update<F>(&self, id: &str, mutate: F) -> TunnelResult<Tunnel>
    where
        F: FnOnce(&mut Tunnel),
    {
        let mut tunnels = self.tunnels.lock().await;
        let index = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TunnelError::not_found("Tunnel", id))?;

        let mut updated = tunnels[index].clone();
        mutate(&mut updated);
        if updated.id != id {
            return Err(TunnelError::validation("id", "tunnel id is immutable"));
        }
        updated.validate()?;
        check_unique(&tunnels, &updated)?;

        let mut next = tunnels.clone();
        next[index] = updated.clone();
        self.persist(&next).await?;
        *tunnels = next;

        Ok(updated)
    }

    /// Remove a record, returning it
    pub async fn delete(&self, id: &str) -> TunnelResult<Tunnel> {
        let mut tunnels = self.tunnels.lock().await;
        let index = tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TunnelError::not_found("Tunnel", id))?;

        let mut next = tunnels.clone();
        let removed = next.remove(index);
        self.persist(&next).await?;
        *tunnels = next;

        info!(tunnel = %id, vni = removed.vni, "Removed tunnel record");
        Ok(removed)
    }

    async fn commit_insert(&self, tunnels: &mut Vec<Tunnel>, tunnel: Tunnel) -> TunnelResult<Tunnel> {
        tunnel.validate()?;
        if tunnels.iter().any(|t| t.id == tunnel.id) {
            return Err(TunnelError::conflict(
                "Tunnel id",
                format!("'{}' already exists", tunnel.id),
            ));
        }
        check_unique(tunnels, &tunnel)?;

        let mut next = tunnels.clone();
        next.push(tunnel.clone());
        self.persist(&next).await?;
        *tunnels = next;

        info!(
            tunnel = %tunnel.id,
            role = %tunnel.role,
            vni = tunnel.vni,
            "Inserted tunnel record"
        );
        Ok(tunnel)
    }

    async fn persist(&self, tunnels: &[Tunnel]) -> TunnelResult<()> {
        let Backing::File(path) = &self.backing else {
            return Ok(());
        };

        let body = serde_json::to_vec_pretty(&RegistryDocument {
            tunnels: tunnels.to_vec(),
        })
        .map_err(|e| TunnelError::storage("serialize registry", e.to_string()))?;

        let path = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| TunnelError::internal(format!("registry writer panicked: {}", e)))?
    }
}

/// Reject `candidate` if another record shares its VNI or overlay subnet
fn check_unique(tunnels: &[Tunnel], candidate: &Tunnel) -> TunnelResult<()> {
    for other in tunnels.iter().filter(|t| t.id != candidate.id) {
        if other.vni == candidate.vni {
            return Err(TunnelError::conflict(
                "VNI",
                format!("{} is used by tunnel '{}'", candidate.vni, other.id),
            ));
        }
        if other.overlay_network() == candidate.overlay_network() {
            return Err(TunnelError::conflict(
                "Overlay subnet",
                format!(
                    "{} is used by tunnel '{}'",
                    overlay_cidr(candidate.relay_overlay_address),
                    other.id
                ),
            ));
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, body: &[u8]) -> TunnelResult<()> {
    let storage_err = |op: &str, e: std::io::Error| {
        TunnelError::storage(format!("{} {}", op, path.display()), e.to_string())
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| storage_err("create directory for", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| storage_err("stage", e))?;
    tmp.write_all(body).map_err(|e| storage_err("write", e))?;
    tmp.as_file().sync_all().map_err(|e| storage_err("sync", e))?;
    tmp.persist(path).map_err(|e| storage_err("rename onto", e.error))?;
    Ok(())
}
