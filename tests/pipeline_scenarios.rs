//! End-to-end pipeline scenarios over a real (in-memory) store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use maildesk::capability::RetryPolicy;
use maildesk::config::PipelineConfig;
use maildesk::pipeline::{PipelineEngine, engine::Outcome};
use maildesk::rules::RulesEngine;
use maildesk::store::{LibSqlStore, TicketFilter, TicketStore};
use maildesk::testing::{
    RecordingMailSender, ScriptedClassifier, ScriptedFieldExtractor, ScriptedSubcategoryExtractor,
    extraction, guess, inbound,
};
use maildesk::ticket::{Category, FollowUpKind, Priority, Stage, Status};

struct World {
    store: Arc<LibSqlStore>,
    mail: Arc<RecordingMailSender>,
    engine: PipelineEngine,
}

async fn world(
    fields: ScriptedFieldExtractor,
    subcategory: ScriptedSubcategoryExtractor,
    config: PipelineConfig,
) -> World {
    let store: Arc<LibSqlStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let mail = Arc::new(RecordingMailSender::new());
    let engine = PipelineEngine::new(
        store.clone(),
        Arc::new(ScriptedClassifier::returning(Category::Incident, 0.95)),
        Arc::new(fields),
        Arc::new(subcategory),
        Arc::new(RulesEngine::default_rules()),
        mail.clone(),
        config,
    );
    World { store, mail, engine }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..Default::default()
    }
}

// One clean email carrying everything: finalized in a single pass, no
// outbound mail, temp record retired but preserved.
#[tokio::test]
async fn complete_email_finalizes_without_questions() {
    let w = world(
        ScriptedFieldExtractor::complete(&[
            ("name", "Alice Martin"),
            ("email", "alice@example.com"),
            ("impact", "le site entier est touche"),
        ]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        fast_config(),
    )
    .await;

    let outcome = w
        .engine
        .handle(inbound("t1", "m1", "plus de reseau sur tout le site"))
        .await
        .unwrap();
    let Outcome::Finalized { ticket_id } = outcome else {
        panic!("expected Finalized, got {outcome:?}");
    };

    let day = Utc::now().format("%Y%m%d").to_string();
    assert_eq!(ticket_id, format!("TKT-{day}-0002"));

    let final_ticket = w.store.get(&ticket_id).await.unwrap().unwrap();
    assert_eq!(final_ticket.stage, Stage::Finalized);
    assert_eq!(final_ticket.priority, Some(Priority::Critical));
    assert_eq!(final_ticket.team.as_deref(), Some("network-ops"));
    assert!(final_ticket.history_is_ordered());
    assert_eq!(final_ticket.history.len(), 5, "one hop per stage");

    // The temp record still exists, retired, pointing at the final id.
    let temp_id = format!("TEMP-FIELDS-{day}-0001");
    let temp = w.store.get(&temp_id).await.unwrap().unwrap();
    assert_eq!(temp.status, Status::Superseded);
    assert_eq!(temp.superseded_by.as_deref(), Some(ticket_id.as_str()));

    assert_eq!(w.mail.sent_count(), 0);
}

// A thread that needs every detour: fields, then subcategory, then
// priority. Each reply re-enters the suspended stage and the ticket
// finally lands with the whole conversation in its transcript.
#[tokio::test]
async fn full_detour_chain_resumes_in_order() {
    let w = world(
        ScriptedFieldExtractor::with_script(vec![
            Ok(extraction(&[], &["name", "email"], 0.9)),
            Ok(extraction(&[("name", "Alice"), ("email", "a@x.fr")], &[], 0.9)),
            // Priority-detour reply extraction.
            Ok(extraction(&[("impact", "un seul poste")], &[], 0.9)),
        ]),
        ScriptedSubcategoryExtractor::with_script(vec![
            Err("model overloaded".into()),
            Ok(guess(None, 0.3)),
            Ok(guess(Some("reseau"), 0.9)),
        ]),
        fast_config(),
    )
    .await;

    // m1: fields are missing.
    let o1 = w.engine.handle(inbound("t1", "m1", "ca ne marche pas")).await.unwrap();
    let Outcome::Suspended { kind, .. } = o1 else {
        panic!("expected Suspended, got {o1:?}");
    };
    assert_eq!(kind, FollowUpKind::Fields);
    assert!(w.mail.last().unwrap().body.contains("name"));

    // m2: fields arrive, but the subcategory guess is unconfident (one
    // transient failure is retried along the way).
    let o2 = w.engine.handle(inbound("t1", "m2", "Alice, a@x.fr")).await.unwrap();
    let Outcome::Suspended { kind, .. } = o2 else {
        panic!("expected Suspended, got {o2:?}");
    };
    assert_eq!(kind, FollowUpKind::Subcategory);

    // m3: enough detail for the subcategory, but the rules need `impact`.
    let o3 = w.engine.handle(inbound("t1", "m3", "c'est le reseau")).await.unwrap();
    let Outcome::Suspended { kind, .. } = o3 else {
        panic!("expected Suspended, got {o3:?}");
    };
    assert_eq!(kind, FollowUpKind::Priority);

    // m4: the impact answer closes the loop.
    let o4 = w.engine.handle(inbound("t1", "m4", "un seul poste")).await.unwrap();
    let Outcome::Finalized { ticket_id: final_id } = o4 else {
        panic!("expected Finalized, got {o4:?}");
    };

    let t = w.store.get(&final_id).await.unwrap().unwrap();
    assert_eq!(t.priority, Some(Priority::Elevated));
    assert_eq!(t.transcript.len(), 4);
    let order: Vec<&str> = t.transcript.iter().map(|e| e.message_id.as_str()).collect();
    assert_eq!(order, vec!["m1", "m2", "m3", "m4"]);
    assert!(t.history_is_ordered());

    // Exactly one active-or-final ticket ever existed on the thread.
    let on_thread = w.store.find_by_thread("t1").await.unwrap();
    assert_eq!(on_thread.len(), 1);
    assert_eq!(on_thread[0].id, final_id);
}

// Redelivered messages never produce a second ticket, a second
// follow-up, or a second ticket number, even after finalization.
#[tokio::test]
async fn replay_is_idempotent_at_every_point() {
    let w = world(
        ScriptedFieldExtractor::with_script(vec![
            Ok(extraction(&[], &["impact"], 0.9)),
            Ok(extraction(&[("impact", "production")], &[], 0.9)),
        ]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        fast_config(),
    )
    .await;

    let o1 = w.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
    assert!(matches!(o1, Outcome::Suspended { .. }));
    let mails_after_first = w.mail.sent_count();

    // Replay while suspended.
    let replay = w.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
    assert!(matches!(replay, Outcome::Duplicate { .. }));
    assert_eq!(w.mail.sent_count(), mails_after_first);

    let o2 = w.engine.handle(inbound("t1", "m2", "production")).await.unwrap();
    let Outcome::Finalized { ticket_id } = o2 else {
        panic!("expected Finalized, got {o2:?}");
    };

    // Replay after finalization.
    let replay = w.engine.handle(inbound("t1", "m2", "production")).await.unwrap();
    assert!(matches!(replay, Outcome::Duplicate { .. }));

    // Still exactly one final ticket, and the counter moved only for the
    // two legitimate draws (temp + final).
    let finalized = w
        .store
        .list(&TicketFilter {
            status: Some(Status::Finalized),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].id, ticket_id);
    let day = Utc::now().format("%Y%m%d").to_string();
    assert_eq!(w.store.next_sequence(&day).await.unwrap(), 3);
}

// An unknown subcategory is a coverage gap: the pipeline still finalizes
// with the lowest priority and the default team.
#[tokio::test]
async fn coverage_gap_defaults_instead_of_failing() {
    let w = world(
        ScriptedFieldExtractor::complete(&[("name", "Bob")]),
        ScriptedSubcategoryExtractor::confident("salle-de-reunion"),
        fast_config(),
    )
    .await;

    let outcome = w
        .engine
        .handle(inbound("t1", "m1", "l'ecran de la salle ne s'allume plus"))
        .await
        .unwrap();
    let Outcome::Finalized { ticket_id } = outcome else {
        panic!("expected Finalized, got {outcome:?}");
    };

    let t = w.store.get(&ticket_id).await.unwrap().unwrap();
    assert_eq!(t.priority, Some(Priority::Standard));
    assert_eq!(
        t.team.as_deref(),
        Some(RulesEngine::default_team(Priority::Standard))
    );
    assert_eq!(t.subcategory.as_deref(), Some("salle-de-reunion"));
}

// A stalled ticket is not dead: a very late reply resumes it.
#[tokio::test]
async fn stalled_ticket_resumes_on_late_reply() {
    let config = fast_config();
    let w = world(
        ScriptedFieldExtractor::with_script(vec![
            Ok(extraction(&[], &["impact"], 0.9)),
            Ok(extraction(&[("impact", "production")], &[], 0.9)),
        ]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        config.clone(),
    )
    .await;

    let o1 = w.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
    let Outcome::Suspended { ticket_id, .. } = o1 else {
        panic!("expected Suspended, got {o1:?}");
    };

    // Silence through the whole reminder budget.
    let followups = w.engine.followups();
    let day = chrono::Duration::days(1);
    let start = Utc::now();
    for i in 1..=3 {
        followups
            .sweep(start + day * i + chrono::Duration::minutes(1))
            .await
            .unwrap();
    }
    let t = w.store.get(&ticket_id).await.unwrap().unwrap();
    assert_eq!(t.status, Status::Stalled);

    // The reply weeks later still lands.
    let o2 = w.engine.handle(inbound("t1", "m2", "pardon: production")).await.unwrap();
    let Outcome::Finalized { ticket_id: final_id } = o2 else {
        panic!("expected Finalized, got {o2:?}");
    };
    let t = w.store.get(&final_id).await.unwrap().unwrap();
    assert_eq!(t.priority, Some(Priority::Critical));
}

// A new request on a thread whose ticket was finalized long ago opens a
// fresh ticket instead of mutating the closed one.
#[tokio::test]
async fn new_message_after_finalization_opens_a_new_ticket() {
    let w = world(
        ScriptedFieldExtractor::complete(&[("impact", "un seul poste")]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        fast_config(),
    )
    .await;

    let o1 = w.engine.handle(inbound("t1", "m1", "plus de wifi")).await.unwrap();
    let Outcome::Finalized { ticket_id: first } = o1 else {
        panic!("expected Finalized, got {o1:?}");
    };

    let o2 = w.engine.handle(inbound("t1", "m2", "ca recommence")).await.unwrap();
    let Outcome::Finalized { ticket_id: second } = o2 else {
        panic!("expected Finalized, got {o2:?}");
    };
    assert_ne!(first, second);

    let first_ticket = w.store.get(&first).await.unwrap().unwrap();
    assert_eq!(first_ticket.transcript.len(), 1, "closed ticket untouched");
}

// Two workers finalizing the same suspended ticket at once: the reserve
// CAS picks exactly one winner, the loser adopts its id, and only one
// final record (with one stage walk) ever exists.
#[tokio::test]
async fn concurrent_finalizers_agree_on_one_ticket() {
    let w = world(
        ScriptedFieldExtractor::with_script(vec![Ok(extraction(&[], &["impact"], 0.9))]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        fast_config(),
    )
    .await;

    let o1 = w.engine.handle(inbound("t1", "m1", "panne")).await.unwrap();
    let Outcome::Suspended { ticket_id, .. } = o1 else {
        panic!("expected Suspended, got {o1:?}");
    };

    let engine = Arc::new(w.engine);
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        let id = ticket_id.clone();
        handles.push(tokio::spawn(
            async move { engine.force_finalize(&id).await.unwrap() },
        ));
    }
    let mut final_ids = Vec::new();
    for h in handles {
        final_ids.push(h.await.unwrap());
    }
    assert_eq!(final_ids[0], final_ids[1], "both finalizers must agree");

    let finalized = w
        .store
        .list(&TicketFilter {
            status: Some(Status::Finalized),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(finalized.len(), 1, "exactly one final record");
    assert_eq!(finalized[0].id, final_ids[0]);
    assert!(finalized[0].history_is_ordered(), "no duplicate stage hops");

    let temp = w.store.get(&ticket_id).await.unwrap().unwrap();
    assert_eq!(temp.status, Status::Superseded);
    assert_eq!(temp.superseded_by.as_deref(), Some(final_ids[0].as_str()));
}

// Concurrent messages on distinct threads each get their own ticket and
// their own sequence number.
#[tokio::test]
async fn concurrent_threads_never_share_numbers() {
    let w = world(
        ScriptedFieldExtractor::complete(&[("impact", "un seul poste")]),
        ScriptedSubcategoryExtractor::confident("reseau"),
        fast_config(),
    )
    .await;
    let engine = Arc::new(w.engine);

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .handle(inbound(&format!("t{i}"), &format!("m{i}"), "panne wifi"))
                .await
                .unwrap()
        }));
    }

    let mut final_ids = std::collections::HashSet::new();
    for h in handles {
        let Outcome::Finalized { ticket_id } = h.await.unwrap() else {
            panic!("expected Finalized");
        };
        assert!(final_ids.insert(ticket_id), "duplicate final id");
    }
    assert_eq!(final_ids.len(), 8);
}
