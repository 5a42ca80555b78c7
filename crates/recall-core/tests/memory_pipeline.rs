//! End-to-end tests of the memory pipeline through `MemoryService`.

mod common;

use std::sync::atomic::Ordering;

use common::{bare_app, full_app, FakeChat, TENANT, USER};
use recall::services::index::is_placeholder;
use recall::services::retriever::SUBJECT_MATCH_SCORE;
use recall::Error;
use recall_models::{MemoryFilter, MemorySource, MemoryType, MemoryUpdate, NewMemory};

fn acme_budget() -> NewMemory {
    NewMemory::new(
        MemoryType::ClientContext,
        MemorySource::UserStated,
        "has a budget of $50,000",
    )
    .with_subject("Acme Corp")
}

async fn seed_acme(app: &common::TestApp) -> String {
    let memory = &app.state.memory;
    let budget = memory.create(TENANT, USER, acme_budget()).await.unwrap();
    memory
        .create(
            TENANT,
            USER,
            NewMemory::new(
                MemoryType::ProjectContext,
                MemorySource::UserStated,
                "launches in March",
            )
            .with_subject("Project Phoenix"),
        )
        .await
        .unwrap();
    memory
        .create(
            TENANT,
            USER,
            NewMemory::new(
                MemoryType::UserPreference,
                MemorySource::UserStated,
                "prefers bullet points in summaries",
            ),
        )
        .await
        .unwrap();
    app.settle().await;
    budget.id
}

async fn assert_acme_scenario(app: &common::TestApp, budget_id: &str) {
    for query in ["Tell me about Acme Corp budget", "What is Acme Corp's budget?"] {
        assert_acme_ranked_first(app, budget_id, query).await;
    }
}

async fn assert_acme_ranked_first(app: &common::TestApp, budget_id: &str, query: &str) {
    let results = app.state.memory.search(TENANT, USER, query, 10).await;
    assert!(!results.is_empty());
    assert_eq!(results[0].memory_id, budget_id);
    assert!(results[0].score >= 0.9);

    let context = app.state.memory.build_context(query, USER, TENANT).await;
    assert!(context
        .context_text
        .contains("[Client: Acme Corp] has a budget of $50,000"));
    assert_eq!(context.attributions.len(), 1);
    assert_eq!(context.attributions[0].subject, "Acme Corp");
    assert_eq!(context.attributions[0].memory_id, budget_id);
    assert!(context.estimated_token_count <= 800);
}

#[tokio::test]
async fn test_acme_scenario_with_vector_store() {
    let app = full_app(FakeChat::answering("[]")).await;
    let budget_id = seed_acme(&app).await;

    let record = app.state.memory.get(TENANT, &budget_id, USER).await.unwrap();
    let embedding_id = record.embedding_id.expect("embedding attached");
    assert!(!is_placeholder(&embedding_id));

    assert_acme_scenario(&app, &budget_id).await;
}

#[tokio::test]
async fn test_acme_scenario_without_backends() {
    let app = bare_app().await;
    let budget_id = seed_acme(&app).await;

    let record = app.state.memory.get(TENANT, &budget_id, USER).await.unwrap();
    assert!(is_placeholder(&record.embedding_id.expect("placeholder attached")));

    assert_acme_scenario(&app, &budget_id).await;
}

#[tokio::test]
async fn test_subject_match_outranks_closer_embedding() {
    let app = full_app(FakeChat::answering("[]")).await;
    let budget_id = seed_acme(&app).await;

    let page = app
        .state
        .memory
        .list(
            TENANT,
            USER,
            &MemoryFilter {
                memory_type: Some(MemoryType::UserPreference),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let unrelated = &page.records[0];
    let point_id = unrelated.embedding_id.as_deref().expect("embedding attached");
    app.vectors.as_ref().unwrap().pin_score(point_id, 0.99);

    let results = app
        .state
        .memory
        .search(TENANT, USER, "Tell me about Acme Corp budget", 10)
        .await;
    let ids: Vec<&str> = results.iter().map(|r| r.memory_id.as_str()).collect();
    assert_eq!(ids[0], budget_id);
    assert!(results[0].score >= 0.9);

    let unrelated_at = ids
        .iter()
        .position(|id| *id == unrelated.id)
        .expect("similar record still returned");
    assert!(unrelated_at > 0);
    assert!(results[unrelated_at].score <= results[0].score);

    let context = app
        .state
        .memory
        .build_context("Tell me about Acme Corp budget", USER, TENANT)
        .await;
    assert_eq!(context.attributions[0].memory_id, budget_id);
}

#[tokio::test]
async fn test_vector_outage_falls_back_to_keywords() {
    let app = full_app(FakeChat::answering("[]")).await;
    seed_acme(&app).await;

    app.vectors
        .as_ref()
        .unwrap()
        .fail
        .store(true, Ordering::SeqCst);

    let results = app.state.memory.search(TENANT, USER, "march", 10).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, "launches in March");
    assert_eq!(results[0].score, 0.9);
}

#[tokio::test]
async fn test_similarity_hits_without_subject() {
    let app = full_app(FakeChat::answering("[]")).await;
    seed_acme(&app).await;

    let results = app
        .state
        .memory
        .search(TENANT, USER, "prefers bullet points in summaries", 10)
        .await;
    assert_eq!(results[0].content, "prefers bullet points in summaries");
    // A perfect embedding match is reported at the subject-hit ceiling
    assert_eq!(results[0].score, SUBJECT_MATCH_SCORE);
}

#[tokio::test]
async fn test_embedding_absent_until_attached() {
    let app = full_app(FakeChat::answering("[]")).await;
    let record = app
        .state
        .memory
        .store()
        .create(TENANT, USER, acme_budget())
        .await
        .unwrap();
    assert!(record.embedding_id.is_none());

    app.state
        .memory
        .store()
        .attach_embedding_id(TENANT, &record.id, "point-1")
        .await
        .unwrap();
    let record = app.state.memory.get(TENANT, &record.id, USER).await.unwrap();
    assert_eq!(record.embedding_id.as_deref(), Some("point-1"));
}

#[tokio::test]
async fn test_update_reembeds_and_drops_old_point() {
    let app = full_app(FakeChat::answering("[]")).await;
    let vectors = app.vectors.clone().unwrap();

    let created = app.state.memory.create(TENANT, USER, acme_budget()).await.unwrap();
    app.settle().await;
    let first = app
        .state
        .memory
        .get(TENANT, &created.id, USER)
        .await
        .unwrap()
        .embedding_id
        .unwrap();

    let updated = app
        .state
        .memory
        .update(
            TENANT,
            &created.id,
            USER,
            &MemoryUpdate {
                content: "has a budget of $75,000".into(),
                subject: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.source, MemorySource::UserCorrected);
    assert_eq!(updated.confidence, 1.0);
    assert_eq!(updated.subject.as_deref(), Some("Acme Corp"));
    app.settle().await;

    let second = app
        .state
        .memory
        .get(TENANT, &created.id, USER)
        .await
        .unwrap()
        .embedding_id
        .unwrap();
    assert_ne!(first, second);
    assert!(vectors.deleted.lock().unwrap().contains(&first));
    assert_eq!(vectors.point_ids(TENANT), vec![second]);
}

#[tokio::test]
async fn test_delete_is_idempotent_and_cleans_vectors() {
    let app = full_app(FakeChat::answering("[]")).await;
    let vectors = app.vectors.clone().unwrap();

    let created = app.state.memory.create(TENANT, USER, acme_budget()).await.unwrap();
    app.settle().await;

    let first = app.state.memory.delete(TENANT, &created.id, USER).await.unwrap();
    let second = app.state.memory.delete(TENANT, &created.id, USER).await.unwrap();
    assert!(first.is_deleted);
    assert_eq!(first.deleted_at, second.deleted_at);
    assert!(vectors.point_ids(TENANT).is_empty());

    let results = app
        .state
        .memory
        .search(TENANT, USER, "What is Acme Corp's budget?", 10)
        .await;
    assert!(results.is_empty());

    let page = app
        .state
        .memory
        .list(TENANT, USER, &MemoryFilter::default())
        .await
        .unwrap();
    assert_eq!(page.total, 0);

    let page = app
        .state
        .memory
        .list(
            TENANT,
            USER,
            &MemoryFilter {
                include_deleted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_forget_all() {
    let app = full_app(FakeChat::answering("[]")).await;
    seed_acme(&app).await;

    let err = app
        .state
        .memory
        .forget_all(TENANT, USER, "please forget")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
    assert_eq!(app.vectors.as_ref().unwrap().point_ids(TENANT).len(), 3);

    let count = app.state.memory.forget_all(TENANT, USER, "FORGET").await.unwrap();
    assert_eq!(count, 3);
    assert!(app.vectors.as_ref().unwrap().point_ids(TENANT).is_empty());

    let context = app
        .state
        .memory
        .build_context("What is Acme Corp's budget?", USER, TENANT)
        .await;
    assert!(context.is_empty());
}

#[tokio::test]
async fn test_tenants_and_users_are_isolated() {
    let app = full_app(FakeChat::answering("[]")).await;
    let budget_id = seed_acme(&app).await;

    for (tenant, user) in [("other-agency", USER), (TENANT, "user-2")] {
        let results = app
            .state
            .memory
            .search(tenant, user, "What is Acme Corp's budget?", 10)
            .await;
        assert!(results.is_empty(), "{}/{} saw foreign memories", tenant, user);

        let err = app.state.memory.get(tenant, &budget_id, user).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}
