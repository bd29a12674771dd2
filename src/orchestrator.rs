//! Exercise-level operations: start, stop, suspend, resume, info.
//!
//! `start` is a saga: boot every VM, then discover and provision every VM,
//! then record the exercise as active. A failure at any point stops every
//! VM that was booted, in reverse order, and removes the exercise directory
//! before the first error is returned.

use futures_util::stream::{self, StreamExt};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{ErrorKind, LabError};
use crate::exercise::{ExerciseRecord, exercise_id, random_suffix};
use crate::logging::UtcTime;
use crate::progress::Progress;
use crate::provision::{self, ProvisionPlan, ProvisionReport, Provisioner};
use crate::registry::Registry;
use crate::remote::RemoteShell;
use crate::report::{self, ExerciseReport, TemplateReport};
use crate::store::{ExerciseLock, Located, StateStore};
use crate::template::LabTemplate;
use crate::vm::{Discovery, VmController};
use crate::vm_state::{Bucket, Operation};

const MAX_ID_ATTEMPTS: usize = 16;

pub struct Orchestrator<B, S> {
    config: Config,
    registry: Registry,
    store: StateStore,
    backend: B,
    shell: S,
    progress: Progress,
}

impl<B: Backend, S: RemoteShell> Orchestrator<B, S> {
    pub fn new(config: Config, backend: B, shell: S, progress: Progress) -> Self {
        let layout = config.layout();
        Self {
            registry: Registry::new(layout.clone()),
            store: StateStore::new(layout),
            config,
            backend,
            shell,
            progress,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn controller(&self) -> VmController<'_, B> {
        VmController::new(&self.backend, Discovery::from_config(&self.config))
    }

    fn parallelism(&self) -> usize {
        self.config.provision.max_parallel.max(1)
    }

    // ── start ───────────────────────────────────────────────

    /// Instantiate `category/lab` as a new exercise.
    pub async fn start(&self, category: &str, lab: &str) -> Result<ExerciseReport, LabError> {
        let template = self.registry.load_template(category, lab)?;
        let plans = self.preflight(&template)?;
        self.store.ensure_layout()?;

        let (mut record, lock) = self.claim(&template)?;
        tracing::info!(exercise = %record.id, vms = record.vms.len(), "starting exercise");

        let runs = match self.bring_up(&template, &plans, &mut record).await {
            Ok(runs) => runs,
            Err(e) => {
                self.rollback(&record, lock).await;
                return Err(e);
            }
        };
        if let Err(e) = self.store.persist_as_active(&mut record) {
            self.rollback(&record, lock).await;
            return Err(e);
        }

        tracing::info!(exercise = %record.id, "exercise active");
        Ok(self.report_with(&record, Some(&template)).with_provisioning(&runs))
    }

    /// Everything that can be checked without touching a VM: base images
    /// exist and every provisioning plan is valid.
    fn preflight(&self, template: &LabTemplate) -> Result<Vec<ProvisionPlan>, LabError> {
        if template.vms.is_empty() {
            return Err(LabError::InvalidConfig {
                path: template.dir.display().to_string(),
                message: "the lab defines no VMs".into(),
            });
        }
        template
            .vms
            .iter()
            .map(|def| {
                if !def.base_image.is_file() {
                    return Err(LabError::NotFound {
                        what: "base image",
                        name: def.base_image.display().to_string(),
                        hint: Some(format!(
                            "create it with `lab create_vm {} {} {} -o <os-variant>`",
                            template.category, template.name, def.name
                        )),
                    });
                }
                provision::plan(def, &template.instructions, &self.config.provision.staging_dir)
            })
            .collect()
    }

    /// Pick an unused ID, lock it and claim its directory.
    fn claim(&self, template: &LabTemplate) -> Result<(ExerciseRecord, ExerciseLock), LabError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let now = UtcTime::now();
            let id = exercise_id(&template.category, &template.name, &now, random_suffix());
            if self.store.contains(&id) {
                continue;
            }
            let lock = match self.store.lock(&id) {
                Ok(lock) => lock,
                Err(e) if e.kind() == ErrorKind::InvalidState => continue,
                Err(e) => return Err(e),
            };
            let record = ExerciseRecord::new(id, template, &self.config, &now);
            match self.store.create(&record) {
                Ok(_) => return Ok((record, lock)),
                Err(e) if e.kind() == ErrorKind::InvalidState => continue,
                Err(e) => return Err(e),
            }
        }
        Err(LabError::InvalidState {
            id: format!("{}-{}", template.category, template.name),
            operation: "be created",
            reason: format!("no free exercise ID after {MAX_ID_ATTEMPTS} attempts"),
            hint: None,
        })
    }

    async fn bring_up(
        &self,
        template: &LabTemplate,
        plans: &[ProvisionPlan],
        record: &mut ExerciseRecord,
    ) -> Result<Vec<(String, ProvisionReport)>, LabError> {
        let controller = self.controller();
        let controller = &controller;

        // Phase 1: boot everything and join.
        self.progress.phase(&format!("Booting {} VM(s)", record.vms.len()));
        let boots: Vec<(usize, Result<(), LabError>)> =
            stream::iter(record.vms.iter().zip(&template.vms).enumerate())
                .map(|(i, (vm, def))| async move {
                    let task = self.progress.task(&vm.name, "creating overlay and importing");
                    let result = controller
                        .boot(vm, &def.base_image, &def.details.os_variant)
                        .await;
                    match &result {
                        Ok(()) => task.finish("booted"),
                        Err(e) => task.fail(&format!("boot failed: {e}")),
                    }
                    (i, result)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;
        first_error(boots)?;

        // Phase 2: discover addresses and provision.
        self.progress.phase("Provisioning");
        let configured: Vec<(usize, Result<(String, ProvisionReport), LabError>)> =
            stream::iter(record.vms.iter().zip(&template.vms).enumerate())
                .map(|(i, (vm, def))| async move {
                    let task = self.progress.task(&vm.name, "waiting for an address");
                    let result = async {
                        let ip = controller.discover_address(&vm.domain).await?;
                        task.set_label(&format!("{ip}: provisioning"));
                        let run = Provisioner::new(&self.shell)
                            .execute(&vm.name, &plans[i], &ip, def.details.ssh_port())
                            .await?;
                        Ok::<_, LabError>((ip, run))
                    }
                    .await;
                    if let Ok((_, run)) = &result {
                        for outcome in &run.scripts {
                            match outcome.exit_status {
                                Some(0) => task.log(&format!("{}: ok", outcome.script)),
                                Some(code) => task.log(&format!("{}: exit {code}", outcome.script)),
                                None => task.log(&format!("{}: no exit status", outcome.script)),
                            }
                        }
                    }
                    match &result {
                        Ok((ip, run)) if run.failed_scripts().next().is_some() => {
                            task.finish(&format!("{ip} (some scripts failed)"))
                        }
                        Ok((ip, _)) => task.finish(ip),
                        Err(e) => task.fail(&format!("provisioning failed: {e}")),
                    }
                    (i, result)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;

        let mut configured = configured;
        configured.sort_by_key(|(i, _)| *i);
        let mut runs = Vec::new();
        let mut failure = None;
        for (i, result) in configured {
            match result {
                Ok((ip, run)) => {
                    record.vms[i].ip = Some(ip);
                    runs.push((record.vms[i].name.clone(), run));
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        self.store.update(record)?;
        Ok(runs)
    }

    async fn rollback(&self, record: &ExerciseRecord, lock: ExerciseLock) {
        tracing::warn!(exercise = %record.id, "start failed, rolling back");
        self.progress.info(&format!("rolling back {}", record.id));

        let controller = self.controller();
        for vm in record.vms.iter().rev() {
            if let Err(e) = controller.stop(&vm.domain).await {
                tracing::warn!(domain = %vm.domain, "rollback could not stop domain: {e}");
            }
        }
        match self.store.destroy(record) {
            Ok(()) => lock.remove(),
            Err(e) => {
                tracing::warn!(exercise = %record.id, "rollback could not remove directory: {e}");
            }
        }
    }

    // ── stop / suspend / resume ─────────────────────────────

    /// Lock an existing exercise and find it.
    fn open(&self, id: &str) -> Result<(ExerciseLock, Located), LabError> {
        let plausible = !id.is_empty() && !id.starts_with('.') && !id.contains('/');
        if !plausible || !self.store.contains(id) {
            return Err(LabError::NotFound {
                what: "exercise",
                name: id.to_string(),
                hint: Some("run `lab list active` or `lab list suspended`".into()),
            });
        }
        let lock = self.store.lock(id)?;
        let located = self.store.locate(id)?;
        Ok((lock, located))
    }

    /// Power off and undefine every VM, then delete the exercise.
    pub async fn stop(&self, id: &str) -> Result<ExerciseRecord, LabError> {
        let (lock, located) = self.open(id)?;
        located.record.state.transition(id, Operation::Stop)?;
        if !located.is_stoppable() {
            return Err(LabError::InvalidState {
                id: id.to_string(),
                operation: Operation::Stop.verb(),
                reason: format!("it is in the {} bucket", located.bucket.as_str()),
                hint: None,
            });
        }

        let controller = self.controller();
        let controller = &controller;
        self.progress.phase(&format!("Stopping {id}"));
        let results: Vec<(usize, Result<(), LabError>)> =
            stream::iter(located.record.vms.iter().enumerate())
                .map(|(i, vm)| async move {
                    let task = self.progress.task(&vm.name, "powering off");
                    let result = controller.stop(&vm.domain).await;
                    match &result {
                        Ok(()) => task.finish("removed"),
                        Err(e) => task.fail(&format!("{e}")),
                    }
                    (i, result)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;
        first_error(results)?;

        self.store.destroy(&located.record)?;
        lock.remove();
        tracing::info!(exercise = id, "exercise stopped");
        Ok(located.record)
    }

    /// Save every VM to disk and move the exercise to `suspended/`.
    ///
    /// VMs are saved one at a time; if one fails the ones already saved are
    /// started again and the exercise stays active.
    pub async fn suspend(&self, id: &str) -> Result<ExerciseRecord, LabError> {
        let (_lock, located) = self.open(id)?;
        let mut record = located.record;
        record.state.transition(id, Operation::Suspend)?;
        self.store.check_destination_free(&record, Bucket::Suspended)?;

        let controller = self.controller();
        self.progress.phase(&format!("Suspending {id}"));
        for (i, vm) in record.vms.iter().enumerate() {
            let task = self.progress.task(&vm.name, "saving state");
            if let Err(e) = controller.suspend(&vm.domain).await {
                task.fail(&format!("{e}"));
                tracing::warn!(exercise = id, domain = %vm.domain, "suspend failed, restarting saved VMs");
                for saved in record.vms[..i].iter().rev() {
                    if let Err(e) = controller.start(&saved.domain).await {
                        tracing::warn!(domain = %saved.domain, "could not restart after failed suspend: {e}");
                    }
                }
                return Err(e);
            }
            task.finish("saved");
        }

        self.store.move_to_suspended(&mut record)?;
        tracing::info!(exercise = id, "exercise suspended");
        Ok(record)
    }

    /// Move the exercise back to `active/`, restore every VM and refresh the
    /// recorded addresses.
    pub async fn resume(&self, id: &str) -> Result<ExerciseReport, LabError> {
        let (_lock, located) = self.open(id)?;
        let mut record = located.record;
        // Overlays must be back under active/ before libvirt opens them.
        self.store.move_to_active(&mut record)?;

        let controller = self.controller();
        let controller = &controller;
        self.progress.phase(&format!("Resuming {id}"));
        let mut results: Vec<(usize, Result<String, LabError>)> =
            stream::iter(record.vms.iter().enumerate())
                .map(|(i, vm)| async move {
                    let task = self.progress.task(&vm.name, "restoring");
                    let result = controller.resume(&vm.domain).await;
                    match &result {
                        Ok(ip) => task.finish(ip),
                        Err(e) => task.fail(&format!("{e}")),
                    }
                    (i, result)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;

        results.sort_by_key(|(i, _)| *i);
        let mut failure = None;
        for (i, result) in results {
            match result {
                Ok(ip) => record.vms[i].ip = Some(ip),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        self.store.update(&record)?;
        if let Some(e) = failure {
            return Err(e);
        }

        tracing::info!(exercise = id, "exercise resumed");
        Ok(self.report_with(&record, None))
    }

    // ── queries ─────────────────────────────────────────────

    pub fn info(&self, id: &str) -> Result<ExerciseReport, LabError> {
        let plausible = !id.is_empty() && !id.starts_with('.') && !id.contains('/');
        if !plausible {
            return Err(LabError::not_found("exercise", id));
        }
        // Read-only: another command may be holding the lock mid-transition.
        let found = self.store.find(id)?;
        Ok(self.report_with(&found.record, None))
    }

    pub fn template_info(&self, category: &str, lab: &str) -> Result<TemplateReport, LabError> {
        let template = self.registry.load_template(category, lab)?;
        Ok(report::template_report(&template))
    }

    pub fn list_exercises(&self, bucket: Bucket) -> Result<Vec<String>, LabError> {
        self.store.list(bucket)
    }

    fn report_with(&self, record: &ExerciseRecord, template: Option<&LabTemplate>) -> ExerciseReport {
        let loaded;
        let template = match template {
            Some(t) => Some(t),
            None => match self.registry.load_template(&record.category, &record.lab) {
                Ok(t) => {
                    loaded = t;
                    Some(&loaded)
                }
                Err(e) => {
                    tracing::warn!(exercise = %record.id, "template unavailable, hiding VM details: {e}");
                    None
                }
            },
        };
        report::exercise_report(record, |vm| {
            template?
                .vms
                .iter()
                .find(|def| def.name == vm)
                .map(|def| &def.details)
        })
    }
}

/// The error of the lowest-indexed failed task, if any.
fn first_error<T>(mut results: Vec<(usize, Result<T, LabError>)>) -> Result<(), LabError> {
    results.sort_by_key(|(i, _)| *i);
    match results.into_iter().find_map(|(_, r)| r.err()) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{Call, FakeBackend};
    use crate::config::tests::test_config;
    use crate::paths::Layout;
    use crate::registry::tests::write_vm;
    use crate::remote::fake::{Event, FakeShell};
    use crate::vm_state::ExerciseState;

    const WEB: &str = "description: web server\nos_variant: debian12\nuser_username: student\nuser_password: pw\nshow_ip: true\nshow_creds: true\n";
    const DB: &str = "description: database\nos_variant: debian12\nuser_username: student\nuser_password: pw\n";

    fn setup(backend: FakeBackend) -> (tempfile::TempDir, Orchestrator<FakeBackend, FakeShell>, FakeShell) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_vm(&layout, "web", "sqli", "web", WEB, &["notes.txt"], &["setup.sh"], &[]);
        write_vm(&layout, "web", "sqli", "db", DB, &[], &[], &[]);
        let shell = FakeShell::new();
        let orch = Orchestrator::new(
            test_config(dir.path()),
            backend,
            shell.clone(),
            Progress::silent(),
        );
        (dir, orch, shell)
    }

    fn all_ids(orch: &Orchestrator<FakeBackend, FakeShell>) -> Vec<String> {
        let mut ids = orch.list_exercises(Bucket::Active).unwrap();
        ids.extend(orch.list_exercises(Bucket::Suspended).unwrap());
        ids
    }

    #[tokio::test]
    async fn start_records_active_exercise_with_addresses() {
        let (_dir, orch, shell) = setup(FakeBackend::new().answering("192.168.122.20"));
        let report = orch.start("web", "sqli").await.unwrap();

        assert!(report.id.starts_with("web-sqli-"));
        let located = orch.store().locate(&report.id).unwrap();
        assert_eq!(located.record.state, ExerciseState::Active);
        assert!(located.record.vms.iter().all(|v| v.ip.as_deref() == Some("192.168.122.20")));

        let web = report.vms.iter().find(|v| v.name == "web").unwrap();
        assert_eq!(web.ip.as_deref(), Some("192.168.122.20"));
        let db = report.vms.iter().find(|v| v.name == "db").unwrap();
        assert_eq!(db.ip, None);

        assert!(shell.events().iter().any(|e| matches!(e, Event::Exec { .. })));
    }

    #[tokio::test]
    async fn start_then_stop_leaves_no_trace() {
        let (dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();
        orch.backend().clear_calls();

        orch.stop(&report.id).await.unwrap();

        assert!(all_ids(&orch).is_empty());
        assert!(!Layout::new(dir.path()).lock_path(&report.id).exists());
        let destroys: Vec<_> = orch
            .backend()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Destroy(_)))
            .collect();
        assert_eq!(destroys.len(), 2);
        assert!(destroys.contains(&Call::Destroy(format!("{}-web", report.id))));
        assert!(destroys.contains(&Call::Destroy(format!("{}-db", report.id))));
    }

    #[tokio::test]
    async fn starts_get_distinct_ids() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let a = orch.start("web", "sqli").await.unwrap();
        let b = orch.start("web", "sqli").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(all_ids(&orch).len(), 2);
    }

    #[tokio::test]
    async fn failed_boot_rolls_back_everything() {
        let (_dir, orch, shell) = setup(FakeBackend::new().answering("10.0.0.3").failing_install("web"));
        let err = orch.start("web", "sqli").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProvisionFailure);
        assert!(all_ids(&orch).is_empty());
        assert_eq!(orch.backend().count(|c| matches!(c, Call::Destroy(_))), 2);
        assert!(orch.backend().running().is_empty());
        assert!(shell.events().is_empty());
    }

    #[tokio::test]
    async fn address_timeout_rolls_back() {
        let (_dir, orch, _shell) = setup(FakeBackend::new());
        let err = orch.start("web", "sqli").await.unwrap_err();
        assert!(matches!(err, LabError::AddressTimeout { .. }));
        assert!(all_ids(&orch).is_empty());
        assert!(orch.backend().running().is_empty());
    }

    #[tokio::test]
    async fn missing_base_image_fails_before_any_vm_call() {
        let (dir, orch, _shell) = setup(FakeBackend::new());
        let layout = Layout::new(dir.path());
        std::fs::remove_file(crate::paths::base_image_path(
            &layout.vm_template_dir("web", "sqli", "db"),
            "db",
        ))
        .unwrap();

        let err = orch.start("web", "sqli").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(orch.backend().calls().is_empty());
        assert!(all_ids(&orch).is_empty());
    }

    #[tokio::test]
    async fn stop_on_suspended_is_invalid_state_without_hypervisor_calls() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();
        orch.suspend(&report.id).await.unwrap();
        orch.backend().clear_calls();

        let err = orch.stop(&report.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(orch.backend().calls().is_empty());
        assert_eq!(orch.list_exercises(Bucket::Suspended).unwrap(), vec![report.id]);
    }

    #[tokio::test]
    async fn stop_unknown_is_not_found() {
        let (_dir, orch, _shell) = setup(FakeBackend::new());
        let err = orch.stop("web-sqli-19700101000000-0000").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(orch.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn suspend_then_resume_preserves_vm_names() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();
        let before = orch.store().locate(&report.id).unwrap().record;

        let suspended = orch.suspend(&report.id).await.unwrap();
        assert_eq!(suspended.state, ExerciseState::Suspended);
        assert_eq!(orch.list_exercises(Bucket::Suspended).unwrap(), vec![report.id.clone()]);

        orch.resume(&report.id).await.unwrap();
        let after = orch.store().locate(&report.id).unwrap().record;
        assert_eq!(after.state, ExerciseState::Active);
        assert_eq!(after.vm_names(), before.vm_names());
        assert_eq!(orch.list_exercises(Bucket::Active).unwrap(), vec![report.id]);
    }

    #[tokio::test]
    async fn failed_suspend_restarts_saved_vms() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3").failing_save("web"));
        let report = orch.start("web", "sqli").await.unwrap();
        orch.backend().clear_calls();

        let err = orch.suspend(&report.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProvisionFailure);
        // VMs are ordered db, web: db was saved before web failed.
        assert_eq!(
            orch.backend().calls(),
            vec![
                Call::Save(format!("{}-db", report.id)),
                Call::Save(format!("{}-web", report.id)),
                Call::Start(format!("{}-db", report.id)),
            ]
        );
        let located = orch.store().locate(&report.id).unwrap();
        assert_eq!(located.bucket, Bucket::Active);
        assert_eq!(located.record.state, ExerciseState::Active);
    }

    #[tokio::test]
    async fn failed_resume_stays_active_and_can_be_retried() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3").failing_start("web"));
        let report = orch.start("web", "sqli").await.unwrap();
        orch.suspend(&report.id).await.unwrap();

        let err = orch.resume(&report.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProvisionFailure);
        let located = orch.store().locate(&report.id).unwrap();
        assert_eq!(located.bucket, Bucket::Active);
        assert_eq!(located.record.state, ExerciseState::Active);
        assert_eq!(orch.list_exercises(Bucket::Suspended).unwrap(), Vec::<String>::new());

        orch.backend().repair_start("web");
        orch.backend().clear_calls();
        let resumed = orch.resume(&report.id).await.unwrap();
        assert_eq!(resumed.state, "active");
        assert_eq!(orch.backend().count(|c| matches!(c, Call::Start(_))), 2);
        assert!(orch.backend().running().contains(&format!("{}-web", report.id)));
        assert_eq!(orch.list_exercises(Bucket::Active).unwrap(), vec![report.id]);
    }

    #[tokio::test]
    async fn info_leaves_a_locked_transition_alone() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();

        // A suspend that has written its record but not yet moved the directory.
        let _held = orch.store().lock(&report.id).unwrap();
        let mut record = orch.store().locate(&report.id).unwrap().record;
        record.state = ExerciseState::Suspended;
        let active = orch.store().exercise_dir(Bucket::Active, &report.id);
        std::fs::write(active.join(crate::store::RECORD_FILE), record.to_json().unwrap()).unwrap();

        let info = orch.info(&report.id).unwrap();
        assert_eq!(info.state, "suspended");
        assert!(active.is_dir());
        assert!(!orch.store().exercise_dir(Bucket::Suspended, &report.id).exists());
    }

    #[tokio::test]
    async fn stop_cleans_up_claim_without_record() {
        let (dir, orch, _shell) = setup(FakeBackend::new());
        let id = "web-sqli-20260101000000-abcd";
        let active = orch.store().exercise_dir(Bucket::Active, id);
        std::fs::create_dir_all(active.join("web")).unwrap();

        let stopped = orch.stop(id).await.unwrap();
        assert_eq!(stopped.state, ExerciseState::Starting);
        assert_eq!(orch.backend().calls(), vec![Call::Destroy(format!("{id}-web"))]);
        assert!(all_ids(&orch).is_empty());
        assert!(!Layout::new(dir.path()).lock_path(id).exists());
    }

    #[tokio::test]
    async fn info_on_claim_without_record_is_starting() {
        let (_dir, orch, _shell) = setup(FakeBackend::new());
        let id = "web-sqli-20260101000000-abcd";
        std::fs::create_dir_all(orch.store().exercise_dir(Bucket::Active, id).join("db")).unwrap();

        let info = orch.info(id).unwrap();
        assert_eq!(info.state, "still starting");
        assert_eq!(info.vms.len(), 1);
        assert_eq!(info.vms[0].ip, None);
    }

    #[tokio::test]
    async fn suspend_twice_is_invalid_state() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();
        orch.suspend(&report.id).await.unwrap();
        let err = orch.suspend(&report.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn info_respects_visibility() {
        let (_dir, orch, _shell) = setup(FakeBackend::new().answering("10.0.0.3"));
        let report = orch.start("web", "sqli").await.unwrap();

        let info = orch.info(&report.id).unwrap();
        let db = info.vms.iter().find(|v| v.name == "db").unwrap();
        assert_eq!(db.ip, None);
        assert_eq!(db.user, None);
        let web = info.vms.iter().find(|v| v.name == "web").unwrap();
        assert_eq!(web.ip.as_deref(), Some("10.0.0.3"));
        assert_eq!(web.user.as_ref().unwrap().username, "student");
    }

    #[test]
    fn template_info_lists_vms() {
        let (_dir, orch, _shell) = setup(FakeBackend::new());
        let info = orch.template_info("web", "sqli").unwrap();
        assert_eq!(info.description, "Web exploitation basics");
        let names: Vec<_> = info.vms.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);
    }
}
