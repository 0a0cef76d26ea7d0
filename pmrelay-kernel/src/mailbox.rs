/**
 * MAILBOX - Boîte à commande unique par hôte
 *
 * RÔLE : Stocke au plus UNE commande en attente par clé d'hôte.
 * Un nouveau dépôt écrase le précédent, `take` consomme atomiquement.
 *
 * BACKENDS :
 * - FileMailbox : un fichier JSON par clé, écriture tmp + rename,
 *   prise par rename vers un fichier de claim unique (un seul gagnant).
 * - MemoryMailbox : HashMap sous mutex, pour les tests et le mode éphémère.
 */

use crate::config::{MailboxBackend, MailboxConf};
use parking_lot::Mutex;
use pmrelay_contracts::PendingCommand;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mailbox JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid mailbox key: {0:?}")]
    InvalidKey(String),
}

pub trait Mailbox: Send + Sync {
    /// Dépose (ou remplace) la commande de `key`.
    fn set(&self, key: &str, cmd: &PendingCommand) -> Result<(), MailboxError>;
    /// Retire et renvoie la commande ; un seul appelant la reçoit.
    fn take(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError>;
    /// Lecture sans consommation (vue admin).
    fn peek(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError>;
    fn clear(&self, key: &str) -> Result<(), MailboxError>;
}

pub type SharedMailbox = Arc<dyn Mailbox>;

pub fn build(conf: &MailboxConf) -> Result<SharedMailbox, MailboxError> {
    match conf.backend {
        MailboxBackend::File => Ok(Arc::new(FileMailbox::open(&conf.dir)?)),
        MailboxBackend::Memory => Ok(Arc::new(MemoryMailbox::default())),
    }
}

fn validate_key(key: &str) -> Result<(), MailboxError> {
    let ok = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok { Ok(()) } else { Err(MailboxError::InvalidKey(key.to_string())) }
}

// ---- fichier ----

const SLOT_EXT: &str = "json";
const TMP_EXT: &str = "tmp";
const CLAIM_EXT: &str = "claim";

pub struct FileMailbox {
    dir: PathBuf,
}

impl FileMailbox {
    pub fn open(dir: &Path) -> Result<Self, MailboxError> {
        std::fs::create_dir_all(dir)?;
        let mailbox = Self { dir: dir.to_path_buf() };
        mailbox.recover()?;
        Ok(mailbox)
    }

    fn slot(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{SLOT_EXT}"))
    }

    /// Nettoyage au démarrage : les tmp orphelins sont supprimés, un claim
    /// interrompu est remis en place s'il n'a pas été remplacé entre-temps.
    fn recover(&self) -> Result<(), MailboxError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some(key) = name.split('.').next() else { continue };
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => {
                    debug!("[mailbox] removing stale {}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
                Some(CLAIM_EXT) => {
                    let slot = self.slot(key);
                    if slot.exists() {
                        let _ = std::fs::remove_file(&path);
                    } else {
                        info!("[mailbox] restoring interrupted command for {key}");
                        std::fs::rename(&path, &slot)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Mailbox for FileMailbox {
    fn set(&self, key: &str, cmd: &PendingCommand) -> Result<(), MailboxError> {
        validate_key(key)?;
        let tmp = self.dir.join(format!("{key}.{}.{TMP_EXT}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_vec(cmd)?)?;
        if let Err(e) = std::fs::rename(&tmp, self.slot(key)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError> {
        validate_key(key)?;
        let claim = self.dir.join(format!("{key}.{}.{CLAIM_EXT}", Uuid::new_v4().simple()));
        // rename atomique : un seul preneur obtient le fichier
        match std::fs::rename(self.slot(key), &claim) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let bytes = std::fs::read(&claim)?;
        let _ = std::fs::remove_file(&claim);
        match serde_json::from_slice(&bytes) {
            Ok(cmd) => Ok(Some(cmd)),
            Err(e) => {
                warn!("[mailbox] dropping unreadable command for {key}: {e}");
                Ok(None)
            }
        }
    }

    fn peek(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError> {
        validate_key(key)?;
        match std::fs::read(self.slot(key)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, key: &str) -> Result<(), MailboxError> {
        validate_key(key)?;
        match std::fs::remove_file(self.slot(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---- mémoire ----

#[derive(Default)]
pub struct MemoryMailbox {
    slots: Mutex<HashMap<String, PendingCommand>>,
}

impl Mailbox for MemoryMailbox {
    fn set(&self, key: &str, cmd: &PendingCommand) -> Result<(), MailboxError> {
        validate_key(key)?;
        self.slots.lock().insert(key.to_string(), cmd.clone());
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError> {
        validate_key(key)?;
        Ok(self.slots.lock().remove(key))
    }

    fn peek(&self, key: &str) -> Result<Option<PendingCommand>, MailboxError> {
        validate_key(key)?;
        Ok(self.slots.lock().get(key).cloned())
    }

    fn clear(&self, key: &str) -> Result<(), MailboxError> {
        validate_key(key)?;
        self.slots.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmrelay_contracts::CommandAction;

    fn cmd(process: &str) -> PendingCommand {
        PendingCommand::new(CommandAction::Restart, process, 1_700_000_000)
    }

    fn both() -> (tempfile::TempDir, Vec<Box<dyn Mailbox>>) {
        let dir = tempfile::tempdir().unwrap();
        let file = FileMailbox::open(dir.path()).unwrap();
        (dir, vec![Box::new(file), Box::new(MemoryMailbox::default())])
    }

    #[test]
    fn test_take_consumes_once() {
        let (_dir, boxes) = both();
        for mb in boxes {
            assert!(mb.take("k1").unwrap().is_none());
            mb.set("k1", &cmd("api")).unwrap();
            assert_eq!(mb.peek("k1").unwrap().unwrap().process, "api");
            assert_eq!(mb.take("k1").unwrap().unwrap().process, "api");
            assert!(mb.take("k1").unwrap().is_none());
        }
    }

    #[test]
    fn test_last_set_wins() {
        let (_dir, boxes) = both();
        for mb in boxes {
            mb.set("k1", &cmd("a")).unwrap();
            mb.set("k1", &cmd("b")).unwrap();
            assert_eq!(mb.take("k1").unwrap().unwrap().process, "b");
            assert!(mb.take("k1").unwrap().is_none());
        }
    }

    #[test]
    fn test_clear_and_key_isolation() {
        let (_dir, boxes) = both();
        for mb in boxes {
            mb.set("k1", &cmd("a")).unwrap();
            mb.set("k2", &cmd("b")).unwrap();
            mb.clear("k1").unwrap();
            mb.clear("missing").unwrap();
            assert!(mb.take("k1").unwrap().is_none());
            assert_eq!(mb.take("k2").unwrap().unwrap().process, "b");
        }
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let (_dir, boxes) = both();
        for mb in boxes {
            assert!(matches!(mb.set("../etc", &cmd("a")), Err(MailboxError::InvalidKey(_))));
            assert!(matches!(mb.take(""), Err(MailboxError::InvalidKey(_))));
        }
    }

    #[test]
    fn test_concurrent_take_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Arc::new(FileMailbox::open(dir.path()).unwrap());
        for round in 0..20 {
            mb.set("race", &cmd(&format!("p{round}"))).unwrap();
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let mb = mb.clone();
                    std::thread::spawn(move || mb.take("race").unwrap())
                })
                .collect();
            let winners = handles.into_iter().filter_map(|h| h.join().unwrap()).count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_set_racing_take_is_never_lost() {
        let dir = tempfile::tempdir().unwrap();
        let mb = Arc::new(FileMailbox::open(dir.path()).unwrap());
        for round in 0..300 {
            let fresh = format!("new{round}");
            mb.set("race", &cmd("old")).unwrap();
            let taker = {
                let mb = mb.clone();
                std::thread::spawn(move || mb.take("race").unwrap())
            };
            let setter = {
                let mb = mb.clone();
                let fresh = fresh.clone();
                std::thread::spawn(move || mb.set("race", &cmd(&fresh)).unwrap())
            };
            setter.join().unwrap();
            let raced = taker.join().unwrap();
            let last = mb.take("race").unwrap();

            let seen: Vec<String> = raced.into_iter().chain(last).map(|c| c.process).collect();
            assert!(seen.contains(&fresh), "round {round}: {seen:?}");
            assert!(mb.take("race").unwrap().is_none());
        }
    }

    #[test]
    fn test_interrupted_claim_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_vec(&cmd("api")).unwrap();
        std::fs::write(dir.path().join("k1.0123abcd.claim"), &body).unwrap();
        std::fs::write(dir.path().join("k2.deadbeef.tmp"), b"{").unwrap();

        let mb = FileMailbox::open(dir.path()).unwrap();
        assert_eq!(mb.take("k1").unwrap().unwrap().process, "api");
        assert!(!dir.path().join("k2.deadbeef.tmp").exists());
    }

    #[test]
    fn test_build_from_conf() {
        let dir = tempfile::tempdir().unwrap();
        let conf = MailboxConf { backend: MailboxBackend::File, dir: dir.path().join("commands") };
        let mb = build(&conf).unwrap();
        mb.set("k1", &cmd("api")).unwrap();
        assert!(dir.path().join("commands").join("k1.json").exists());
    }
}
