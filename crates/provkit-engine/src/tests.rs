use super::*;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use semver::{Version, VersionReq};

use provkit_core::{NullProgress, Operand, ProgressMonitor, Severity, Status, Unit};
use provkit_registry::{Profile, ProfileRegistry};

static TEST_ENGINE_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_registry_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_ENGINE_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "provkit-engine-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}

fn unit(id: &str, version: &str) -> Unit {
    Unit::parse(id, version).expect("must build unit")
}

type Journal = Arc<Mutex<Vec<String>>>;

fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn journal_entries(journal: &Journal) -> Vec<String> {
    journal.lock().expect("journal must lock").clone()
}

/// Test action writing every execute/undo into a shared journal, with
/// optional failure or panic triggered by the incoming unit id.
struct RecordingAction {
    id: String,
    journal: Journal,
    fail_on_unit: Option<String>,
    panic_on_unit: Option<String>,
}

impl RecordingAction {
    fn new(id: &str, journal: &Journal) -> Self {
        Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            fail_on_unit: None,
            panic_on_unit: None,
        }
    }

    fn failing_on(id: &str, journal: &Journal, unit_id: &str) -> Self {
        let mut action = Self::new(id, journal);
        action.fail_on_unit = Some(unit_id.to_string());
        action
    }

    fn panicking_on(id: &str, journal: &Journal, unit_id: &str) -> Self {
        let mut action = Self::new(id, journal);
        action.panic_on_unit = Some(unit_id.to_string());
        action
    }

    fn trigger_matches(&self, trigger: &Option<String>, operand: &Operand) -> bool {
        match trigger {
            Some(unit_id) => operand
                .added_unit()
                .or_else(|| operand.removed_unit())
                .map(|unit| unit.id() == unit_id)
                .unwrap_or(false),
            None => false,
        }
    }
}

impl ProvisioningAction for RecordingAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute(
        &self,
        _profile: &mut Profile,
        _context: &ProvisioningContext,
        operand: &Operand,
    ) -> Status {
        self.journal
            .lock()
            .expect("journal must lock")
            .push(format!("{}:execute:{}", self.id, operand));
        if self.trigger_matches(&self.panic_on_unit, operand) {
            panic!("{} blew up", self.id);
        }
        if self.trigger_matches(&self.fail_on_unit, operand) {
            return Status::error(format!("{} refused {}", self.id, operand));
        }
        Status::ok()
    }

    fn undo(
        &self,
        _profile: &mut Profile,
        _context: &ProvisioningContext,
        operand: &Operand,
    ) -> Status {
        self.journal
            .lock()
            .expect("journal must lock")
            .push(format!("{}:undo:{}", self.id, operand));
        Status::ok()
    }
}

const ALL_PHASE_IDS: [&str; 7] = [
    "collect",
    "verify-trust",
    "unconfigure",
    "uninstall",
    "set-properties",
    "install",
    "configure",
];

fn recording_registry(journal: &Journal) -> ActionRegistry {
    let mut actions = ActionRegistry::new();
    for id in ALL_PHASE_IDS {
        actions.register(
            Version::new(1, 0, 0),
            Arc::new(RecordingAction::new(id, journal)),
        );
    }
    actions
}

fn recording_registry_with(journal: &Journal, override_action: RecordingAction) -> ActionRegistry {
    let mut actions = ActionRegistry::new();
    let override_id = override_action.id.clone();
    for id in ALL_PHASE_IDS {
        if id == override_id {
            continue;
        }
        actions.register(
            Version::new(1, 0, 0),
            Arc::new(RecordingAction::new(id, journal)),
        );
    }
    actions.register(Version::new(1, 0, 0), Arc::new(override_action));
    actions
}

struct TestSetup {
    registry: Arc<ProfileRegistry>,
    engine: Engine,
    profile: Profile,
}

fn setup_with_actions(actions: ActionRegistry) -> TestSetup {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry =
        Arc::new(ProfileRegistry::open(test_registry_root()).expect("must open registry"));
    let profile = registry
        .add_profile("target", BTreeMap::new(), None)
        .expect("must add profile");
    let engine = Engine::new(Arc::clone(&registry), Arc::new(actions));
    TestSetup {
        registry,
        engine,
        profile,
    }
}

fn preinstall(registry: &ProfileRegistry, profile: &mut Profile, unit: Unit) {
    profile.add_unit(unit);
    let token = registry.lock_profile(profile.id()).expect("must lock");
    registry.update_profile(profile).expect("must update");
    registry.unlock_profile(token).expect("must unlock");
}

#[test]
fn empty_operand_list_is_a_noop() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));

    // No lock is taken and nothing is written for an empty plan.
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("empty plan must succeed");
    assert_eq!(status.severity(), Severity::Ok);
    assert!(journal_entries(&journal).is_empty());
    assert_eq!(
        setup.registry.list_timestamps("target").expect("must list").len(),
        1
    );
}

#[test]
fn install_scenario_commits_one_snapshot() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    let before = setup.registry.list_timestamps("target").expect("must list");

    let a = unit("a", "1.0.0");
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(a.clone())],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("install must succeed");
    assert_eq!(status.severity(), Severity::Ok, "unexpected status: {status}");

    let after = setup.registry.list_timestamps("target").expect("must list");
    assert_eq!(after.len(), before.len() + 1, "exactly one new snapshot");

    let profile = setup
        .registry
        .get_profile("target")
        .expect("must load")
        .expect("profile must exist");
    assert!(profile.has_unit(&a));

    // Incoming-side phases ran in pipeline order.
    let entries = journal_entries(&journal);
    let executes: Vec<&str> = entries
        .iter()
        .filter(|entry| entry.contains(":execute:"))
        .map(String::as_str)
        .collect();
    assert_eq!(
        executes,
        [
            "collect:execute:install a@1.0.0",
            "verify-trust:execute:install a@1.0.0",
            "install:execute:install a@1.0.0",
            "configure:execute:install a@1.0.0",
        ]
    );
}

#[test]
fn failing_action_rolls_back_in_reverse_order() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry_with(
        &journal,
        RecordingAction::failing_on("install", &journal, "a"),
    ));
    let before = setup.registry.list_timestamps("target").expect("must list");
    let latest_path = setup
        .registry
        .layout()
        .snapshot_path("target", *before.last().expect("must have snapshot"));
    let persisted_before = fs::read_to_string(&latest_path).expect("must read snapshot");

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);

    // No partial commit: persisted state is byte-identical.
    let after = setup.registry.list_timestamps("target").expect("must list");
    assert_eq!(after, before);
    let persisted_after = fs::read_to_string(&latest_path).expect("must read snapshot");
    assert_eq!(persisted_after, persisted_before);

    let profile = setup
        .registry
        .get_profile("target")
        .expect("must load")
        .expect("profile must exist");
    assert_eq!(profile.unit_count(), 0);

    // Undo runs in reverse completion order, starting with the action
    // that failed (its undo must clean up partial work).
    let entries = journal_entries(&journal);
    assert_eq!(
        entries,
        [
            "collect:execute:install a@1.0.0",
            "verify-trust:execute:install a@1.0.0",
            "install:execute:install a@1.0.0",
            "install:undo:install a@1.0.0",
            "verify-trust:undo:install a@1.0.0",
            "collect:undo:install a@1.0.0",
        ]
    );
}

#[test]
fn snapshot_write_failure_surfaces_error_and_rolls_back() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));

    // Pin the next snapshot name with a planted far-future snapshot,
    // then block its staging path so persisting the profile fails.
    let far_future: u64 = 4_102_444_800_000;
    let initial = setup.profile.timestamp();
    let content = fs::read_to_string(setup.registry.layout().snapshot_path("target", initial))
        .expect("must read snapshot");
    fs::write(
        setup.registry.layout().snapshot_path("target", far_future),
        &content,
    )
    .expect("must plant snapshot");
    fs::create_dir_all(
        setup
            .registry
            .layout()
            .snapshot_staging_path("target", far_future + 1),
    )
    .expect("must block staging path");
    let before = setup.registry.list_timestamps("target").expect("must list");

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);
    assert!(
        status.to_string().contains("failed persisting"),
        "status: {status}"
    );

    // Every executed phase was undone and nothing new was persisted.
    let entries = journal_entries(&journal);
    assert!(entries.contains(&"configure:undo:install a@1.0.0".to_string()));
    assert!(entries.contains(&"collect:undo:install a@1.0.0".to_string()));
    assert_eq!(
        setup.registry.list_timestamps("target").expect("must list"),
        before
    );

    // The failed run must not leak the lock.
    let token = setup.registry.lock_profile("target").expect("must lock");
    setup.registry.unlock_profile(token).expect("must unlock");
}

#[test]
fn failure_in_first_phase_returns_the_single_child_status() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry_with(
        &journal,
        RecordingAction::failing_on("collect", &journal, "a"),
    ));

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");

    // Only one phase contributed detail, so the aggregate collapses to
    // that phase's status.
    assert_eq!(status.severity(), Severity::Error);
    assert_eq!(status.message(), "phase 'collect'");
}

#[test]
fn panicking_action_is_contained_and_rolled_back() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry_with(
        &journal,
        RecordingAction::panicking_on("install", &journal, "a"),
    ));

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);
    assert!(status.to_string().contains("panicked"), "status: {status}");

    // The run fault must not leak the lock.
    let token = setup
        .registry
        .lock_profile("target")
        .expect("lock must be free after the failed run");
    setup.registry.unlock_profile(token).expect("must unlock");

    let entries = journal_entries(&journal);
    assert!(entries.contains(&"install:undo:install a@1.0.0".to_string()));
    assert!(entries.contains(&"collect:undo:install a@1.0.0".to_string()));
}

struct CancelAfterFirstPhase {
    worked: u64,
}

impl ProgressMonitor for CancelAfterFirstPhase {
    fn is_canceled(&self) -> bool {
        self.worked > 0
    }

    fn begin_task(&mut self, _name: &str, _total: u64) {}

    fn worked(&mut self, units: u64) {
        self.worked += units;
    }

    fn done(&mut self) {}
}

#[test]
fn cancellation_between_phases_rolls_back_completed_work() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    let before = setup.registry.list_timestamps("target").expect("must list");

    let mut progress = CancelAfterFirstPhase { worked: 0 };
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut progress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Cancel);

    // Collect completed and was undone; nothing later ever ran.
    let entries = journal_entries(&journal);
    assert_eq!(
        entries,
        [
            "collect:execute:install a@1.0.0",
            "collect:undo:install a@1.0.0",
        ]
    );
    assert_eq!(
        setup.registry.list_timestamps("target").expect("must list"),
        before
    );
}

#[test]
fn replace_operand_swaps_unit_versions() {
    let journal = new_journal();
    let mut setup = setup_with_actions(recording_registry(&journal));
    let old = unit("a", "1.0.0");
    let new = unit("a", "2.0.0");
    preinstall(&setup.registry, &mut setup.profile, old.clone());

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::replace(old.clone(), new.clone())],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("replace must succeed");
    assert_eq!(status.severity(), Severity::Ok, "unexpected status: {status}");

    let profile = setup
        .registry
        .get_profile("target")
        .expect("must load")
        .expect("profile must exist");
    assert!(!profile.has_unit(&old));
    assert!(profile.has_unit(&new));

    // Both sides of the change flowed through their phases.
    let entries = journal_entries(&journal);
    assert!(entries.contains(&"uninstall:execute:replace a@1.0.0 with a@2.0.0".to_string()));
    assert!(entries.contains(&"install:execute:replace a@1.0.0 with a@2.0.0".to_string()));
}

#[test]
fn property_operands_apply_and_revert() {
    let journal = new_journal();
    let mut setup = setup_with_actions(recording_registry(&journal));
    setup.profile.set_property("env", Some("staging".to_string()));
    let token = setup.registry.lock_profile("target").expect("must lock");
    setup
        .registry
        .update_profile(&mut setup.profile)
        .expect("must update");
    setup.registry.unlock_profile(token).expect("must unlock");

    // Successful run: the set-properties phase rewrites the profile.
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::profile_property(
                "env",
                Some("staging".to_string()),
                Some("prod".to_string()),
            )],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("property change must succeed");
    assert_eq!(status.severity(), Severity::Ok);
    let profile = setup
        .registry
        .get_profile("target")
        .expect("must load")
        .expect("profile must exist");
    assert_eq!(profile.local_property("env"), Some("prod"));

    // Failing run: the already-applied property change is reverted.
    let failing = setup_with_actions(recording_registry_with(
        &new_journal(),
        RecordingAction::failing_on("install", &new_journal(), "a"),
    ));
    let mut profile = failing.profile.snapshot();
    profile.set_property("env", Some("staging".to_string()));
    let token = failing.registry.lock_profile("target").expect("must lock");
    failing
        .registry
        .update_profile(&mut profile)
        .expect("must update");
    failing.registry.unlock_profile(token).expect("must unlock");

    let status = failing
        .engine
        .perform(
            &profile,
            &PhaseSet::default_set(),
            &[
                Operand::profile_property(
                    "env",
                    Some("staging".to_string()),
                    Some("prod".to_string()),
                ),
                Operand::install(unit("a", "1.0.0")),
            ],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);

    let reloaded = failing
        .registry
        .get_profile("target")
        .expect("must load")
        .expect("profile must exist");
    assert_eq!(reloaded.local_property("env"), Some("staging"));
    assert_eq!(reloaded.unit_count(), 0);
}

#[test]
fn validate_batches_every_missing_action() {
    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    for id in ALL_PHASE_IDS {
        if id == "install" {
            continue;
        }
        actions.register(
            Version::new(1, 0, 0),
            Arc::new(RecordingAction::new(id, &journal)),
        );
    }
    let setup = setup_with_actions(actions);

    let status = setup
        .engine
        .validate(
            &setup.profile,
            &PhaseSet::default_set(),
            &[
                Operand::install(unit("a", "1.0.0")),
                Operand::install(unit("b", "2.0.0")),
            ],
            &ProvisioningContext::new(),
        )
        .expect("validate must run");

    assert_eq!(status.severity(), Severity::Error);
    assert!(status.message().contains("1 action(s)"), "status: {status}");
    assert_eq!(status.children().len(), 1);
    assert!(status.children()[0].message().contains("'install'"));

    // Nothing executed, nothing locked, nothing written.
    assert!(journal_entries(&journal).is_empty());
    assert_eq!(
        setup.registry.list_timestamps("target").expect("must list").len(),
        1
    );
    let token = setup.registry.lock_profile("target").expect("must lock");
    setup.registry.unlock_profile(token).expect("must unlock");
}

struct RangedPhase;

impl Phase for RangedPhase {
    fn id(&self) -> &str {
        "ranged"
    }

    fn weight(&self) -> u64 {
        1
    }

    fn is_applicable(&self, operand: &Operand) -> bool {
        operand.is_unit_change()
    }

    fn action_specs(&self, _operand: &Operand) -> Vec<ActionSpec> {
        vec![ActionSpec::new(
            "custom-step",
            Some(VersionReq::parse("^2").expect("range must parse")),
        )]
    }
}

#[test]
fn validate_names_the_version_range_of_misses() {
    let setup = setup_with_actions(ActionRegistry::new());
    let phase_set = PhaseSet::new(vec![Arc::new(RangedPhase)]);

    let status = setup
        .engine
        .validate(
            &setup.profile,
            &phase_set,
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
        )
        .expect("validate must run");
    assert_eq!(status.severity(), Severity::Error);
    let detail = status.children()[0].message();
    assert!(detail.contains("'custom-step'"), "detail: {detail}");
    assert!(detail.contains("^2"), "detail: {detail}");
}

#[test]
fn unresolved_action_at_run_time_fails_and_rolls_back() {
    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    for id in ALL_PHASE_IDS {
        if id == "install" {
            continue;
        }
        actions.register(
            Version::new(1, 0, 0),
            Arc::new(RecordingAction::new(id, &journal)),
        );
    }
    let setup = setup_with_actions(actions);

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);
    assert!(
        status.to_string().contains("no action registered"),
        "status: {status}"
    );
    assert!(journal_entries(&journal).contains(&"collect:undo:install a@1.0.0".to_string()));
}

#[test]
fn unknown_profile_is_a_contract_error() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    setup.registry.remove_profile("target").expect("must remove");

    let err = setup
        .engine
        .perform(
            &setup.profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect_err("unknown profile must fail fast");
    assert!(err.to_string().contains("does not exist"));
    assert!(journal_entries(&journal).is_empty());
}

#[test]
fn profile_held_by_another_process_reports_in_use() {
    let journal = new_journal();
    let root = test_registry_root();
    let registry = Arc::new(ProfileRegistry::open(&root).expect("must open registry"));
    let profile = registry
        .add_profile("target", BTreeMap::new(), None)
        .expect("must add profile");
    let engine = Engine::new(Arc::clone(&registry), Arc::new(recording_registry(&journal)));

    // Simulates a foreign process: a separate registry instance with
    // its own lock table and file descriptors over the same root.
    let foreign = ProfileRegistry::open(&root).expect("must open foreign registry");
    let foreign_token = foreign.lock_profile("target").expect("must lock");

    let err = engine
        .perform(
            &profile,
            &PhaseSet::default_set(),
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect_err("contended profile must fail");
    assert!(err.to_string().contains("in use"), "error: {err:#}");
    assert!(journal_entries(&journal).is_empty());

    foreign.unlock_profile(foreign_token).expect("must unlock");
}

struct CountingProgress {
    begin_total: u64,
    worked: u64,
}

impl ProgressMonitor for CountingProgress {
    fn is_canceled(&self) -> bool {
        false
    }

    fn begin_task(&mut self, _name: &str, total: u64) {
        self.begin_total = total;
    }

    fn worked(&mut self, units: u64) {
        self.worked += units;
    }

    fn done(&mut self) {}
}

#[test]
fn progress_weight_uses_truncating_division() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));

    // One of two operands is applicable to the single phase, so the
    // phase's share is 3 * 1 / 2 = 1 (truncated), of a budget of 3.
    let phase_set = PhaseSet::new(vec![Arc::new(PipelinePhase::with_weight(
        PhaseKind::Collect,
        3,
    ))]);
    let mut progress = CountingProgress {
        begin_total: 0,
        worked: 0,
    };
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &phase_set,
            &[
                Operand::install(unit("a", "1.0.0")),
                Operand::profile_property("env", None, Some("prod".to_string())),
            ],
            &ProvisioningContext::new(),
            &mut progress,
        )
        .expect("perform must succeed");
    assert_eq!(status.severity(), Severity::Ok);
    assert_eq!(progress.begin_total, 3);
    assert_eq!(progress.worked, 1);
}

#[test]
fn pause_gate_suspends_a_running_pipeline() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    let phase_set = Arc::new(PhaseSet::default_set());
    let gate = phase_set.pause_gate();
    gate.pause();

    let engine = Arc::new(setup.engine);
    let profile = setup.profile.snapshot();
    let worker_engine = Arc::clone(&engine);
    let worker_phase_set = Arc::clone(&phase_set);
    let worker = std::thread::spawn(move || {
        worker_engine
            .perform(
                &profile,
                &worker_phase_set,
                &[Operand::install(unit("a", "1.0.0"))],
                &ProvisioningContext::new(),
                &mut NullProgress,
            )
            .expect("perform must succeed")
    });

    std::thread::sleep(Duration::from_millis(100));
    assert!(!worker.is_finished(), "pipeline must be suspended");
    assert!(journal_entries(&journal).is_empty(), "paused before any action");

    gate.resume();
    let status = worker.join().expect("worker must finish");
    assert_eq!(status.severity(), Severity::Ok);
}

struct HookedPhase {
    journal: Journal,
}

impl Phase for HookedPhase {
    fn id(&self) -> &str {
        "hooked"
    }

    fn weight(&self) -> u64 {
        1
    }

    fn is_applicable(&self, _operand: &Operand) -> bool {
        true
    }

    fn action_specs(&self, _operand: &Operand) -> Vec<ActionSpec> {
        vec![ActionSpec::new("hooked", None)]
    }

    fn prepare(&self, _profile: &Profile, _context: &ProvisioningContext) -> Status {
        self.journal
            .lock()
            .expect("journal must lock")
            .push("hooked:prepare".to_string());
        Status::ok()
    }

    fn commit(&self, _profile: &Profile, _context: &ProvisioningContext) -> Status {
        self.journal
            .lock()
            .expect("journal must lock")
            .push("hooked:commit".to_string());
        Status::ok()
    }
}

#[test]
fn prepare_and_commit_hooks_run_only_on_success() {
    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    actions.register(
        Version::new(1, 0, 0),
        Arc::new(RecordingAction::new("hooked", &journal)),
    );
    let setup = setup_with_actions(actions);
    let phase_set = PhaseSet::new(vec![Arc::new(HookedPhase {
        journal: Arc::clone(&journal),
    })]);

    let status = setup
        .engine
        .perform(
            &setup.profile,
            &phase_set,
            &[Operand::profile_property("env", None, Some("prod".to_string()))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must succeed");
    assert_eq!(status.severity(), Severity::Ok);
    let entries = journal_entries(&journal);
    assert!(entries.contains(&"hooked:prepare".to_string()));
    assert!(entries.contains(&"hooked:commit".to_string()));

    // Failure path: the hooks must not run.
    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    actions.register(
        Version::new(1, 0, 0),
        Arc::new(RecordingAction::failing_on("hooked", &journal, "a")),
    );
    let setup = setup_with_actions(actions);
    let phase_set = PhaseSet::new(vec![Arc::new(HookedPhase {
        journal: Arc::clone(&journal),
    })]);
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &phase_set,
            &[Operand::install(unit("a", "1.0.0"))],
            &ProvisioningContext::new(),
            &mut NullProgress,
        )
        .expect("perform must return a status");
    assert_eq!(status.severity(), Severity::Error);
    let entries = journal_entries(&journal);
    assert!(!entries.contains(&"hooked:prepare".to_string()));
    assert!(!entries.contains(&"hooked:commit".to_string()));
}

#[test]
fn action_registry_picks_highest_matching_version() {
    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    actions.register(
        Version::new(1, 4, 0),
        Arc::new(RecordingAction::new("step", &journal)),
    );
    actions.register(
        Version::new(2, 1, 0),
        Arc::new(RecordingAction::new("step", &journal)),
    );

    let v1 = VersionReq::parse("^1").expect("range must parse");
    match actions.resolve("step", Some(&v1)) {
        ResolvedAction::Resolved(action) => assert_eq!(action.id(), "step"),
        ResolvedAction::Missing { .. } => panic!("^1 must resolve"),
    }

    let unmatched = VersionReq::parse("^3").expect("range must parse");
    match actions.resolve("step", Some(&unmatched)) {
        ResolvedAction::Missing {
            action_id,
            version_range,
        } => {
            assert_eq!(action_id, "step");
            assert_eq!(version_range, Some(unmatched));
        }
        ResolvedAction::Resolved(_) => panic!("^3 must be missing"),
    }

    match actions.resolve("step", None) {
        ResolvedAction::Resolved(action) => assert_eq!(action.id(), "step"),
        ResolvedAction::Missing { .. } => panic!("unranged lookup must resolve"),
    }

    // Memo invalidation keeps resolution working.
    actions.invalidate();
    assert!(!actions.resolve("step", None).is_missing());
    assert_eq!(actions.registered_ids(), ["step".to_string()]);
}

#[test]
fn create_plan_is_empty_and_carries_nested_installer_plan() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    let context = ProvisioningContext::new();

    let mut plan = setup.engine.create_plan(&setup.profile, &context);
    assert_eq!(plan.profile_id(), "target");
    assert!(plan.is_empty());
    assert_eq!(plan.status().severity(), Severity::Ok);

    plan.add_operand(Operand::install(unit("a", "1.0.0")));
    assert_eq!(plan.operands().len(), 1);

    let mut installer = ProvisioningPlan::new("target", context);
    installer.add_operand(Operand::install(unit("provisioner", "9.0.0")));
    plan.set_installer_plan(installer);
    let nested = plan.installer_plan().expect("nested plan must be set");
    assert_eq!(nested.operands().len(), 1);

    plan.set_status(Status::warning("partial plan"));
    assert_eq!(plan.status().severity(), Severity::Warning);
}

#[test]
fn context_environment_is_visible_to_actions() {
    struct EnvCheckAction {
        journal: Journal,
    }

    impl ProvisioningAction for EnvCheckAction {
        fn id(&self) -> &str {
            "collect"
        }

        fn execute(
            &self,
            _profile: &mut Profile,
            context: &ProvisioningContext,
            _operand: &Operand,
        ) -> Status {
            self.journal.lock().expect("journal must lock").push(format!(
                "collect:env:{}",
                context.get("mode").unwrap_or("unset")
            ));
            Status::ok()
        }

        fn undo(
            &self,
            _profile: &mut Profile,
            _context: &ProvisioningContext,
            _operand: &Operand,
        ) -> Status {
            Status::ok()
        }
    }

    let journal = new_journal();
    let mut actions = ActionRegistry::new();
    actions.register(
        Version::new(1, 0, 0),
        Arc::new(EnvCheckAction {
            journal: Arc::clone(&journal),
        }),
    );
    let setup = setup_with_actions(actions);
    let phase_set = PhaseSet::new(vec![Arc::new(PipelinePhase::new(PhaseKind::Collect))]);

    let mut context = ProvisioningContext::new();
    context.set("mode", "offline");
    let status = setup
        .engine
        .perform(
            &setup.profile,
            &phase_set,
            &[Operand::install(unit("a", "1.0.0"))],
            &context,
            &mut NullProgress,
        )
        .expect("perform must succeed");
    assert_eq!(status.severity(), Severity::Ok);
    assert_eq!(journal_entries(&journal), ["collect:env:offline"]);
}

#[test]
fn session_tracks_started_phases_in_forward_order() {
    let journal = new_journal();
    let setup = setup_with_actions(recording_registry(&journal));
    let phase_set = PhaseSet::default_set();

    let mut session = EngineSession::new(setup.profile.snapshot(), ProvisioningContext::new());
    let status = phase_set.perform(
        &mut session,
        &recording_registry(&journal),
        &[Operand::install(unit("a", "1.0.0"))],
        &mut NullProgress,
    );
    assert_eq!(status.severity(), Severity::Ok);
    assert_eq!(
        session.started_phase_ids(),
        ALL_PHASE_IDS
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
    );
}
