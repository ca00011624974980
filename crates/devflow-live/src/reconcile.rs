//! Applies decoded events to the cache.
//!
//! Every field is reconciled one of two ways. Fields whose new value is
//! fully carried by the event (a task's status, a new session, a session's
//! outcome, a deletion) are patched in place. Everything else marks the
//! owning collection stale and leaves the refetch to the consumer. The
//! mapping from event kind to effect lives in [`plan`], a pure function with
//! an exhaustive match, so a new event kind cannot be added without giving it
//! a rule.
//!
//! Patches are idempotent under replay of the same event. Reordering of
//! different events is not corrected; the next invalidation-driven refetch
//! converges the cache.

use crate::cache::{Cache, CacheWriter, CollectionKey};
use crate::invalidation::InvalidationSender;
use chrono::{DateTime, Utc};
use devflow_core::{DomainEvent, Finding, Phase, Session, SessionStatus, Task, TaskStatus};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    SetTaskStatus {
        task_id: String,
        status: TaskStatus,
        at: DateTime<Utc>,
    },
    InsertSession(Session),
    FinishSession {
        session_id: String,
        status: SessionStatus,
        at: DateTime<Utc>,
    },
    /// With `session_id`, only marks the task executing while that cached
    /// session is still running.
    SetExecuting {
        task_id: String,
        executing: bool,
        session_id: Option<String>,
    },
    RemoveTask {
        task_id: String,
    },
}

/// Cache effects of one event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub patches: Vec<Patch>,
    pub invalidate: BTreeSet<CollectionKey>,
}

impl Plan {
    fn patch(mut self, patch: Patch) -> Self {
        self.patches.push(patch);
        self
    }

    fn invalidate(mut self, key: CollectionKey) -> Self {
        self.invalidate.insert(key);
        self
    }
}

pub fn plan(event: &DomainEvent, now: DateTime<Utc>) -> Plan {
    let plan = Plan::default();
    match event {
        DomainEvent::TaskCreated(_) | DomainEvent::TaskUpdated(_) => {
            plan.invalidate(CollectionKey::Tasks)
        }
        DomainEvent::TaskStatusChanged(change) => plan.patch(Patch::SetTaskStatus {
            task_id: change.task_id.clone(),
            status: change.to_status,
            at: change.changed_at.unwrap_or(now),
        }),
        DomainEvent::TaskDeleted(deleted) => plan.patch(Patch::RemoveTask {
            task_id: deleted.task_id.clone(),
        }),
        DomainEvent::SessionStarted(started) => plan
            .patch(Patch::InsertSession(Session {
                id: started.session_id.clone(),
                task_id: started.task_id.clone(),
                phase: started.phase.clone(),
                status: started.status.unwrap_or(SessionStatus::Running),
                started_at: started.started_at.unwrap_or(now),
                completed_at: None,
            }))
            .patch(Patch::SetExecuting {
                task_id: started.task_id.clone(),
                executing: true,
                session_id: Some(started.session_id.clone()),
            }),
        DomainEvent::SessionEnded(ended) => plan
            .patch(Patch::FinishSession {
                session_id: ended.session_id.clone(),
                status: SessionStatus::from_success(ended.success),
                at: ended.ended_at.unwrap_or(now),
            })
            .patch(Patch::SetExecuting {
                task_id: ended.task_id.clone(),
                executing: false,
                session_id: None,
            })
            .invalidate(CollectionKey::Sessions(ended.task_id.clone())),
        DomainEvent::PhaseCompleted(progress) | DomainEvent::PhaseContinuing(progress) => plan
            .invalidate(CollectionKey::Phases(progress.task_id.clone()))
            .invalidate(CollectionKey::Sessions(progress.task_id.clone())),
        DomainEvent::WorkspaceCreated(_)
        | DomainEvent::WorkspaceMerged(_)
        | DomainEvent::WorkspaceDeleted(_) => plan.invalidate(CollectionKey::Tasks),
        DomainEvent::ReviewCompleted(review) => {
            plan.invalidate(CollectionKey::Findings(review.task_id.clone()))
        }
        DomainEvent::Unknown(_) => plan,
    }
}

/// A refetch the consumer owes: `key` went stale because of `cause`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub key: CollectionKey,
    pub cause: String,
}

/// Authoritative data fetched by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Tasks(Vec<Task>),
    Sessions { task_id: String, sessions: Vec<Session> },
    Phases { task_id: String, phases: Vec<Phase> },
    Findings { task_id: String, findings: Vec<Finding> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    pub patched: usize,
    pub invalidated: Vec<CollectionKey>,
}

/// Sole writer of the cache.
pub(crate) struct Reconciler {
    cache: CacheWriter,
    invalidations: InvalidationSender,
    events: broadcast::Sender<DomainEvent>,
}

impl Reconciler {
    pub(crate) fn new(
        cache: CacheWriter,
        invalidations: InvalidationSender,
        events: broadcast::Sender<DomainEvent>,
    ) -> Self {
        Self {
            cache,
            invalidations,
            events,
        }
    }

    pub(crate) fn apply(&self, event: DomainEvent) -> Outcome {
        self.apply_at(event, Utc::now())
    }

    pub(crate) fn apply_at(&self, event: DomainEvent, now: DateTime<Utc>) -> Outcome {
        let Plan {
            patches,
            mut invalidate,
        } = plan(&event, now);
        let patched = self.cache.write(|cache| {
            let mut patched = 0;
            for patch in patches {
                match apply_patch(cache, patch) {
                    Applied::Changed => patched += 1,
                    Applied::Unchanged => {}
                    Applied::Missing(fallback) => {
                        if let Some(key) = fallback {
                            invalidate.insert(key);
                        }
                    }
                }
            }
            let mut newly_stale = false;
            for key in &invalidate {
                newly_stale |= !cache.is_stale(key);
                cache.mark_stale(key.clone());
            }
            (patched, patched > 0 || newly_stale)
        });

        let kind = event.kind_str().to_string();
        debug!(
            event = "live_reconciled",
            kind = %kind,
            patched,
            invalidated = invalidate.len()
        );
        let invalidated = invalidate.into_iter().collect::<Vec<_>>();
        self.emit_invalidations(&invalidated, &kind);
        // No listeners is fine; the cache already carries the effect.
        let _ = self.events.send(event);
        Outcome {
            patched,
            invalidated,
        }
    }

    pub(crate) fn apply_fetch(&self, result: FetchResult) {
        let key = match &result {
            FetchResult::Tasks(_) => CollectionKey::Tasks,
            FetchResult::Sessions { task_id, .. } => CollectionKey::Sessions(task_id.clone()),
            FetchResult::Phases { task_id, .. } => CollectionKey::Phases(task_id.clone()),
            FetchResult::Findings { task_id, .. } => CollectionKey::Findings(task_id.clone()),
        };
        debug!(event = "live_fetch_applied", collection = %key);
        self.cache.write(|cache| {
            match result {
                FetchResult::Tasks(tasks) => cache.replace_tasks(tasks),
                FetchResult::Sessions { task_id, sessions } => {
                    cache.replace_sessions(&task_id, sessions)
                }
                FetchResult::Phases { task_id, phases } => cache.replace_phases(&task_id, phases),
                FetchResult::Findings { task_id, findings } => {
                    cache.replace_findings(&task_id, findings)
                }
            }
            ((), true)
        });
    }

    /// Project switch: forget everything and ask for the task list again.
    pub(crate) fn reset_project(&self) {
        self.cache.write(|cache| {
            cache.clear();
            cache.mark_stale(CollectionKey::Tasks);
            ((), true)
        });
        info!(event = "live_project_reset");
        self.emit_invalidations(&[CollectionKey::Tasks], "project_reset");
    }

    fn emit_invalidations(&self, keys: &[CollectionKey], cause: &str) {
        for key in keys {
            if !self.invalidations.push(key, cause) {
                debug!(event = "live_invalidation_unobserved", collection = %key);
            }
        }
    }
}

enum Applied {
    Changed,
    Unchanged,
    /// Target entity absent; carries the collection to refetch instead.
    Missing(Option<CollectionKey>),
}

fn apply_patch(cache: &mut Cache, patch: Patch) -> Applied {
    let changed = match patch {
        Patch::SetTaskStatus {
            task_id,
            status,
            at,
        } => match cache.set_task_status(&task_id, status, at) {
            Some(changed) => changed,
            None => return Applied::Missing(Some(CollectionKey::Tasks)),
        },
        Patch::InsertSession(session) => cache.insert_session(session),
        Patch::FinishSession {
            session_id,
            status,
            at,
        } => match cache.finish_session(&session_id, status, at) {
            Some(changed) => changed,
            None => return Applied::Missing(None),
        },
        Patch::SetExecuting {
            task_id,
            executing,
            session_id,
        } => {
            let running = session_id.as_deref().map_or(true, |session_id| {
                cache
                    .session(session_id)
                    .is_some_and(|session| session.status == SessionStatus::Running)
            });
            // A late start for a finished session must not re-mark the task.
            if executing && !running {
                false
            } else {
                cache.set_executing(&task_id, executing)
            }
        }
        Patch::RemoveTask { task_id } => cache.remove_task(&task_id),
    };
    if changed {
        Applied::Changed
    } else {
        Applied::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{shared, CacheReader};
    use crate::invalidation::{self, Invalidations};
    use chrono::TimeZone;
    use devflow_core::events::{
        PhaseProgress, SessionEnded, SessionStarted, TaskRef, TaskStatusChanged, UnknownEvent,
        WorkspaceChange,
    };
    use devflow_core::EventKind;
    use proptest::prelude::*;
    use std::collections::HashMap;

    struct Harness {
        reconciler: Reconciler,
        reader: CacheReader,
        invalidations: Invalidations,
        events: broadcast::Receiver<DomainEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (writer, reader) = shared();
            let (inv_tx, invalidations) = invalidation::queue();
            let (event_tx, events) = broadcast::channel(64);
            Self {
                reconciler: Reconciler::new(writer, inv_tx, event_tx),
                reader,
                invalidations,
                events,
            }
        }

        fn drain_invalidations(&mut self) -> Vec<CollectionKey> {
            let mut keys = Vec::new();
            while let Ok(invalidation) = self.invalidations.try_recv() {
                keys.push(invalidation.key);
            }
            keys
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000, 0).single().expect("timestamp")
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            title: "Add OAuth login".to_string(),
            description: "Use the provider SDK".to_string(),
            status,
            workspace_path: Some("/work/t1".to_string()),
            updated_at: None,
            extra: HashMap::new(),
        }
    }

    fn status_changed(task_id: &str, to: TaskStatus) -> DomainEvent {
        DomainEvent::TaskStatusChanged(TaskStatusChanged {
            task_id: task_id.to_string(),
            from_status: None,
            to_status: to,
            changed_at: None,
        })
    }

    fn session_started(task_id: &str, session_id: &str) -> DomainEvent {
        DomainEvent::SessionStarted(SessionStarted {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            phase: Some("coding".to_string()),
            status: None,
            started_at: None,
        })
    }

    #[test]
    fn plan_covers_every_known_kind() {
        for kind in EventKind::ALL {
            let event = DomainEvent::from_value(
                serde_json::json!({
                    "type": kind.as_str(),
                    "task_id": "t1",
                    "session_id": "s1",
                    "to_status": "done",
                    "success": true
                }),
                None,
            )
            .expect("decode");
            let plan = plan(&event, now());
            assert!(
                !plan.patches.is_empty() || !plan.invalidate.is_empty(),
                "{kind} has no effect"
            );
        }
    }

    #[test]
    fn status_change_patches_only_status() {
        let mut h = Harness::new();
        h.reconciler
            .apply_fetch(FetchResult::Tasks(vec![task("t1", TaskStatus::Review)]));
        let before = h.reader.read(|cache| cache.task("t1").cloned()).expect("task");

        let outcome = h.reconciler.apply_at(status_changed("t1", TaskStatus::Done), now());
        assert_eq!(outcome.patched, 1);
        assert!(outcome.invalidated.is_empty());
        assert!(h.drain_invalidations().is_empty());

        let after = h.reader.read(|cache| cache.task("t1").cloned()).expect("task");
        assert_eq!(after.status, TaskStatus::Done);
        assert_eq!(after.updated_at, Some(now()));
        assert_eq!(
            Task {
                status: before.status,
                updated_at: before.updated_at,
                ..after
            },
            before
        );
    }

    #[test]
    fn status_change_for_unknown_task_falls_back_to_refetch() {
        let mut h = Harness::new();
        let outcome = h.reconciler.apply_at(status_changed("ghost", TaskStatus::Done), now());
        assert_eq!(outcome.patched, 0);
        assert_eq!(outcome.invalidated, vec![CollectionKey::Tasks]);
        assert_eq!(h.drain_invalidations(), vec![CollectionKey::Tasks]);
    }

    #[test]
    fn session_started_inserts_once_and_marks_executing() {
        let h = Harness::new();
        let first = h.reconciler.apply_at(session_started("t1", "s1"), now());
        assert_eq!(first.patched, 2);
        let snapshot = h.reader.snapshot();
        let session = snapshot.session("s1").expect("session");
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.task_id, "t1");
        assert_eq!(session.started_at, now());
        assert!(snapshot.is_executing("t1"));

        let revision = h.reader.revision();
        let replay = h.reconciler.apply_at(session_started("t1", "s1"), now());
        assert_eq!(replay.patched, 0);
        assert_eq!(h.reader.revision(), revision);
    }

    #[test]
    fn session_ended_patches_and_invalidates_session_list() {
        let mut h = Harness::new();
        h.reconciler.apply_at(session_started("t1", "s1"), now());
        let outcome = h.reconciler.apply_at(
            DomainEvent::SessionEnded(SessionEnded {
                session_id: "s1".to_string(),
                task_id: "t1".to_string(),
                success: false,
                ended_at: None,
            }),
            now(),
        );
        assert_eq!(outcome.patched, 2);
        assert_eq!(
            h.drain_invalidations(),
            vec![CollectionKey::Sessions("t1".to_string())]
        );
        let snapshot = h.reader.snapshot();
        let session = snapshot.session("s1").expect("session");
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.completed_at, Some(now()));
        assert!(!snapshot.is_executing("t1"));
    }

    fn session(id: &str, task_id: &str, status: SessionStatus) -> Session {
        Session {
            id: id.to_string(),
            task_id: task_id.to_string(),
            phase: Some("coding".to_string()),
            status,
            started_at: now(),
            completed_at: None,
        }
    }

    #[test]
    fn fetched_sessions_settle_the_executing_flag() {
        let h = Harness::new();
        h.reconciler.apply_at(session_started("t1", "s1"), now());
        assert!(h.reader.read(|cache| cache.is_executing("t1")));

        // The matching session.ended was lost; the refetch is authoritative.
        h.reconciler.apply_fetch(FetchResult::Sessions {
            task_id: "t1".to_string(),
            sessions: vec![session("s1", "t1", SessionStatus::Completed)],
        });
        let snapshot = h.reader.snapshot();
        assert_eq!(
            snapshot.session("s1").map(|session| session.status),
            Some(SessionStatus::Completed)
        );
        assert!(!snapshot.is_executing("t1"));

        h.reconciler.apply_fetch(FetchResult::Sessions {
            task_id: "t1".to_string(),
            sessions: vec![
                session("s1", "t1", SessionStatus::Completed),
                session("s2", "t1", SessionStatus::Running),
            ],
        });
        assert!(h.reader.read(|cache| cache.is_executing("t1")));
    }

    #[test]
    fn late_duplicate_start_leaves_finished_task_idle() {
        let h = Harness::new();
        h.reconciler.apply_at(session_started("t1", "s1"), now());
        h.reconciler.apply_at(
            DomainEvent::SessionEnded(SessionEnded {
                session_id: "s1".to_string(),
                task_id: "t1".to_string(),
                success: true,
                ended_at: None,
            }),
            now(),
        );
        let revision = h.reader.revision();
        let late = h.reconciler.apply_at(session_started("t1", "s1"), now());
        assert_eq!(late.patched, 0);
        assert_eq!(h.reader.revision(), revision);
        assert!(!h.reader.read(|cache| cache.is_executing("t1")));
    }

    #[test]
    fn phase_events_invalidate_phases_and_sessions_once_each() {
        let mut h = Harness::new();
        let event = DomainEvent::PhaseCompleted(PhaseProgress {
            task_id: "t1".to_string(),
            phase: Some("planning".to_string()),
            session_id: None,
        });
        let phases = CollectionKey::Phases("t1".to_string());
        let sessions = CollectionKey::Sessions("t1".to_string());
        for _ in 0..2 {
            let outcome = h.reconciler.apply_at(event.clone(), now());
            assert_eq!(outcome.invalidated, vec![sessions.clone(), phases.clone()]);
            assert_eq!(h.drain_invalidations(), vec![sessions.clone(), phases.clone()]);
        }
    }

    #[test]
    fn unread_invalidations_coalesce_per_collection() {
        let mut h = Harness::new();
        for _ in 0..10_000 {
            h.reconciler.reset_project();
        }
        h.reconciler.apply_at(
            DomainEvent::TaskCreated(TaskRef {
                task_id: "t2".to_string(),
            }),
            now(),
        );
        assert_eq!(h.invalidations.pending(), 1);
        let queued = h.invalidations.try_recv().expect("queued");
        assert_eq!(queued.key, CollectionKey::Tasks);
        assert_eq!(queued.cause, "project_reset");
    }

    #[test]
    fn workspace_and_task_changes_invalidate_the_task_list() {
        let mut h = Harness::new();
        h.reconciler.apply_at(
            DomainEvent::WorkspaceMerged(WorkspaceChange {
                task_id: Some("t1".to_string()),
                path: None,
            }),
            now(),
        );
        assert_eq!(h.drain_invalidations(), vec![CollectionKey::Tasks]);
        h.reconciler.apply_at(
            DomainEvent::TaskCreated(TaskRef {
                task_id: "t2".to_string(),
            }),
            now(),
        );
        assert_eq!(h.drain_invalidations(), vec![CollectionKey::Tasks]);
        assert!(h.reader.read(|cache| cache.is_stale(&CollectionKey::Tasks)));
    }

    #[test]
    fn task_deleted_removes_task_and_its_sessions() {
        let h = Harness::new();
        h.reconciler
            .apply_fetch(FetchResult::Tasks(vec![task("t1", TaskStatus::InProgress)]));
        h.reconciler.apply_at(session_started("t1", "s1"), now());
        h.reconciler.apply_at(
            DomainEvent::TaskDeleted(TaskRef {
                task_id: "t1".to_string(),
            }),
            now(),
        );
        let snapshot = h.reader.snapshot();
        assert!(snapshot.task("t1").is_none());
        assert!(snapshot.session("s1").is_none());
        assert!(!snapshot.is_executing("t1"));
    }

    #[test]
    fn unknown_events_only_reach_listeners() {
        let mut h = Harness::new();
        let revision = h.reader.revision();
        let event = DomainEvent::Unknown(UnknownEvent {
            kind: "roadmap.generated".to_string(),
            payload: serde_json::json!({}),
        });
        let outcome = h.reconciler.apply_at(event.clone(), now());
        assert_eq!(outcome, Outcome::default());
        assert_eq!(h.reader.revision(), revision);
        assert_eq!(h.events.try_recv().ok(), Some(event));
    }

    #[test]
    fn fetch_clears_stale_and_reset_forgets_everything() {
        let mut h = Harness::new();
        h.reconciler.apply_at(
            DomainEvent::ReviewCompleted(TaskRef {
                task_id: "t1".to_string(),
            }),
            now(),
        );
        let findings = CollectionKey::Findings("t1".to_string());
        assert!(h.reader.read(|cache| cache.is_stale(&findings)));
        h.reconciler.apply_fetch(FetchResult::Findings {
            task_id: "t1".to_string(),
            findings: vec![Finding {
                id: "f1".to_string(),
                severity: Default::default(),
                title: "Unchecked unwrap".to_string(),
                file: Some("src/lib.rs".to_string()),
                line: Some(12),
            }],
        });
        assert!(!h.reader.read(|cache| cache.is_stale(&findings)));
        assert_eq!(h.reader.read(|cache| cache.findings("t1").len()), 1);

        h.drain_invalidations();
        h.reconciler.reset_project();
        assert_eq!(h.drain_invalidations(), vec![CollectionKey::Tasks]);
        let snapshot = h.reader.snapshot();
        assert!(snapshot.findings("t1").is_empty());
        assert!(snapshot.is_stale(&CollectionKey::Tasks));
        assert!(!snapshot.is_stale(&findings));
    }

    fn patchable_event() -> impl Strategy<Value = DomainEvent> {
        let task_id = prop_oneof![Just("t1"), Just("t2")];
        let session_id = prop_oneof![Just("s1"), Just("s2")];
        let status = prop_oneof![
            Just(TaskStatus::Backlog),
            Just(TaskStatus::InProgress),
            Just(TaskStatus::Review),
            Just(TaskStatus::Done),
        ];
        prop_oneof![
            (task_id.clone(), status).prop_map(|(task, to)| status_changed(task, to)),
            (task_id.clone(), session_id.clone())
                .prop_map(|(task, session)| session_started(task, session)),
            (task_id.clone(), session_id, any::<bool>()).prop_map(|(task, session, success)| {
                DomainEvent::SessionEnded(SessionEnded {
                    session_id: session.to_string(),
                    task_id: task.to_string(),
                    success,
                    ended_at: None,
                })
            }),
            task_id.prop_map(|task| DomainEvent::TaskDeleted(TaskRef {
                task_id: task.to_string()
            })),
        ]
    }

    fn cache_view(cache: &Cache) -> String {
        format!(
            "{:?}|{:?}|{:?}",
            cache.tasks().collect::<Vec<_>>(),
            cache.sessions_for_task("t1"),
            cache.executing_tasks().collect::<Vec<_>>()
        )
    }

    proptest! {
        #[test]
        fn replaying_a_patch_event_changes_nothing(
            history in proptest::collection::vec(patchable_event(), 0..12),
            event in patchable_event(),
        ) {
            let h = Harness::new();
            h.reconciler.apply_fetch(FetchResult::Tasks(vec![
                task("t1", TaskStatus::Backlog),
                task("t2", TaskStatus::Review),
            ]));
            for past in history {
                h.reconciler.apply_at(past, now());
            }
            h.reconciler.apply_at(event.clone(), now());
            let once = h.reader.read(cache_view);
            let later = now() + chrono::Duration::seconds(30);
            let replay = h.reconciler.apply_at(event, later);
            prop_assert_eq!(replay.patched, 0);
            prop_assert_eq!(h.reader.read(cache_view), once);
        }
    }
}
