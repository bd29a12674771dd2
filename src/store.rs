//! Directory-backed exercise state store.
//!
//! Each exercise is a directory holding `exercise.json` plus one
//! subdirectory per VM overlay. The recorded `ExerciseState` is
//! authoritative; which bucket (`active/` or `suspended/`) the directory sits
//! in is its projection, and every transition writes the record first and
//! then performs a single `rename` of the directory.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::LabError;
use crate::exercise::{ExerciseRecord, VmInstance, domain_name};
use crate::paths::Layout;
use crate::vm_state::{Bucket, ExerciseState, Operation};

pub const RECORD_FILE: &str = "exercise.json";

pub struct StateStore {
    layout: Layout,
}

/// An exercise found in the store.
#[derive(Debug, Clone)]
pub struct Located {
    pub bucket: Bucket,
    pub dir: PathBuf,
    pub record: ExerciseRecord,
}

impl Located {
    /// Only exercises in the active bucket can be stopped.
    pub fn is_stoppable(&self) -> bool {
        self.bucket == Bucket::Active
    }
}

/// Exclusive advisory lock on one exercise, released when dropped.
#[derive(Debug)]
pub struct ExerciseLock {
    file: File,
    path: PathBuf,
}

impl ExerciseLock {
    /// Unlink the lock file, then release the lock. Only for exercises that
    /// no longer exist: a process that opened the old file fails its lookup
    /// with NotFound once it gets the lock.
    pub fn remove(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "could not remove lock file: {e}");
        }
        drop(self.file);
    }
}

impl StateStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        match bucket {
            Bucket::Active => self.layout.active_dir(),
            Bucket::Suspended => self.layout.suspended_dir(),
        }
    }

    pub fn exercise_dir(&self, bucket: Bucket, id: &str) -> PathBuf {
        self.bucket_dir(bucket).join(id)
    }

    /// Create the bucket and lock directories if missing.
    pub fn ensure_layout(&self) -> Result<(), LabError> {
        for dir in [
            self.layout.active_dir(),
            self.layout.suspended_dir(),
            self.layout.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| LabError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn list(&self, bucket: Bucket) -> Result<Vec<String>, LabError> {
        let dir = self.bucket_dir(bucket);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LabError::io(format!("reading {}", dir.display()), e)),
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// True if `id` exists in any bucket.
    pub fn contains(&self, id: &str) -> bool {
        [Bucket::Active, Bucket::Suspended]
            .iter()
            .any(|b| self.exercise_dir(*b, id).exists())
    }

    /// Find an exercise without changing anything on disk. The bucket is
    /// where the directory is, which may lag the recorded state while
    /// another command is mid-transition.
    pub fn find(&self, id: &str) -> Result<Located, LabError> {
        let active = self.exercise_dir(Bucket::Active, id);
        let suspended = self.exercise_dir(Bucket::Suspended, id);

        let (bucket, dir) = match (active.is_dir(), suspended.is_dir()) {
            (true, true) => {
                return Err(LabError::InvalidState {
                    id: id.to_string(),
                    operation: "be located",
                    reason: "it is present in both the active and suspended buckets".into(),
                    hint: Some(format!(
                        "inspect {} and {} and remove the stale copy",
                        active.display(),
                        suspended.display()
                    )),
                });
            }
            (true, false) => (Bucket::Active, active),
            (false, true) => (Bucket::Suspended, suspended),
            (false, false) => {
                return Err(LabError::NotFound {
                    what: "exercise",
                    name: id.to_string(),
                    hint: Some("run `lab list active` or `lab list suspended`".into()),
                });
            }
        };

        let record = if bucket == Bucket::Active && !dir.join(RECORD_FILE).exists() {
            self.recover_record(id, &dir)?
        } else {
            read_record(&dir)?
        };
        Ok(Located { bucket, dir, record })
    }

    /// Find an exercise, repairing the bucket projection if a transition
    /// was interrupted between the record write and the directory move.
    /// Callers must hold the exercise lock.
    pub fn locate(&self, id: &str) -> Result<Located, LabError> {
        let found = self.find(id)?;
        let wanted = found.record.state.bucket();
        if wanted == found.bucket {
            return Ok(found);
        }

        tracing::warn!(
            exercise = id,
            found = found.bucket.as_str(),
            recorded = %found.record.state,
            "exercise directory disagrees with recorded state, moving it"
        );
        let target = self.exercise_dir(wanted, id);
        rename_dir(id, &found.dir, &target)?;
        Ok(Located {
            bucket: wanted,
            dir: target,
            record: found.record,
        })
    }

    /// Stand-in record for an `active/` directory whose claim was
    /// interrupted before `exercise.json` was written. Each VM
    /// subdirectory becomes an instance so `stop` can undefine its domain.
    fn recover_record(&self, id: &str, dir: &Path) -> Result<ExerciseRecord, LabError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| LabError::io(format!("reading {}", dir.display()), e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();

        tracing::warn!(exercise = id, vms = names.len(), "exercise has no record, treating it as starting");
        let vms = names
            .into_iter()
            .map(|name| VmInstance {
                domain: domain_name(id, &name),
                overlay: self.layout.overlay_path(id, &name).display().to_string(),
                name,
                ip: None,
                cpus: 0,
                memory_mb: 0,
            })
            .collect();
        Ok(ExerciseRecord {
            id: id.to_string(),
            category: String::new(),
            lab: String::new(),
            state: ExerciseState::Starting,
            created_at: String::new(),
            vms,
        })
    }

    /// Claim `active/<id>` and write the record. Fails if the ID is taken.
    pub fn create(&self, record: &ExerciseRecord) -> Result<PathBuf, LabError> {
        if self.exercise_dir(Bucket::Suspended, &record.id).exists() {
            return Err(already_exists(&record.id));
        }
        let dir = self.exercise_dir(Bucket::Active, &record.id);
        fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                already_exists(&record.id)
            } else {
                LabError::io(format!("creating {}", dir.display()), e)
            }
        })?;
        write_record(&dir, record)?;
        tracing::info!(exercise = %record.id, "exercise directory created");
        Ok(dir)
    }

    /// Rewrite the record in place, keeping its bucket.
    pub fn update(&self, record: &ExerciseRecord) -> Result<(), LabError> {
        let dir = self.exercise_dir(record.state.bucket(), &record.id);
        write_record(&dir, record)
    }

    pub fn persist_as_active(&self, record: &mut ExerciseRecord) -> Result<(), LabError> {
        self.transition(record, Operation::Activate)
    }

    pub fn move_to_suspended(&self, record: &mut ExerciseRecord) -> Result<(), LabError> {
        self.transition(record, Operation::Suspend)
    }

    pub fn move_to_active(&self, record: &mut ExerciseRecord) -> Result<(), LabError> {
        self.transition(record, Operation::Resume)
    }

    /// Fail if moving `record` to `bucket` would collide with an existing
    /// directory. Called before any VM is touched.
    pub fn check_destination_free(&self, record: &ExerciseRecord, bucket: Bucket) -> Result<(), LabError> {
        if bucket != record.state.bucket() && self.exercise_dir(bucket, &record.id).exists() {
            return Err(LabError::InvalidState {
                id: record.id.clone(),
                operation: "be moved",
                reason: format!("{} already exists in the {} bucket", record.id, bucket.as_str()),
                hint: None,
            });
        }
        Ok(())
    }

    fn transition(&self, record: &mut ExerciseRecord, op: Operation) -> Result<(), LabError> {
        let Some(next) = record.state.transition(&record.id, op)? else {
            return Err(LabError::InvalidState {
                id: record.id.clone(),
                operation: op.verb(),
                reason: "the operation removes the exercise".into(),
                hint: None,
            });
        };

        let from = self.exercise_dir(record.state.bucket(), &record.id);
        let to = self.exercise_dir(next.bucket(), &record.id);
        self.check_destination_free(record, next.bucket())?;

        let previous = record.state;
        record.state = next;
        if let Err(e) = write_record(&from, record) {
            record.state = previous;
            return Err(e);
        }
        if from != to {
            rename_dir(&record.id, &from, &to)?;
        }
        tracing::info!(exercise = %record.id, from = %previous, to = %next, "exercise state changed");
        Ok(())
    }

    /// Remove the exercise directory. Only valid from the active bucket.
    pub fn destroy(&self, record: &ExerciseRecord) -> Result<(), LabError> {
        if record.state.bucket() != Bucket::Active {
            return Err(LabError::InvalidState {
                id: record.id.clone(),
                operation: "be destroyed",
                reason: format!("it is {}", record.state),
                hint: None,
            });
        }
        let dir = self.exercise_dir(Bucket::Active, &record.id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LabError::io(format!("removing {}", dir.display()), e)),
        }
        tracing::info!(exercise = %record.id, path = %dir.display(), "exercise directory removed");
        Ok(())
    }

    /// Take the per-exercise lock without blocking.
    pub fn lock(&self, id: &str) -> Result<ExerciseLock, LabError> {
        let dir = self.layout.locks_dir();
        fs::create_dir_all(&dir).map_err(|e| LabError::io(format!("creating {}", dir.display()), e))?;

        let path = self.layout.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LabError::io(format!("opening lock file {}", path.display()), e))?;

        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(LabError::InvalidState {
                    id: id.to_string(),
                    operation: "be modified",
                    reason: "another lab command is operating on it".into(),
                    hint: Some("wait for the other command to finish".into()),
                });
            }
            return Err(LabError::io(format!("locking {}", path.display()), err));
        }
        Ok(ExerciseLock { file, path })
    }
}

fn already_exists(id: &str) -> LabError {
    LabError::InvalidState {
        id: id.to_string(),
        operation: "be created",
        reason: "an exercise with this ID already exists".into(),
        hint: None,
    }
}

fn rename_dir(id: &str, from: &Path, to: &Path) -> Result<(), LabError> {
    if to.exists() {
        return Err(LabError::InvalidState {
            id: id.to_string(),
            operation: "be moved",
            reason: format!("{} already exists", to.display()),
            hint: None,
        });
    }
    fs::rename(from, to).map_err(|e| {
        LabError::io(format!("moving {} to {}", from.display(), to.display()), e)
    })
}

fn read_record(dir: &Path) -> Result<ExerciseRecord, LabError> {
    let path = dir.join(RECORD_FILE);
    let contents = fs::read_to_string(&path)
        .map_err(|e| LabError::io(format!("reading {}", path.display()), e))?;
    ExerciseRecord::from_json(&contents).map_err(|message| LabError::InvalidConfig {
        path: path.display().to_string(),
        message,
    })
}

/// Write the record via a temp file and rename so readers never see a
/// partial document.
fn write_record(dir: &Path, record: &ExerciseRecord) -> Result<(), LabError> {
    let path = dir.join(RECORD_FILE);
    let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
    let json = record.to_json().map_err(|message| LabError::InvalidConfig {
        path: path.display().to_string(),
        message,
    })?;
    fs::write(&tmp, json).map_err(|e| LabError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, &path).map_err(|e| LabError::io(format!("writing {}", path.display()), e))
}
