#[allow(dead_code)]
mod common;

use common::{TestServer, connect_moderator, make_questions, seed_game};
use kviz_core::question::Question;

#[tokio::test]
async fn game_lookup_by_pin() {
    let server = TestServer::new().await;
    seed_game(&server.state, "123456", &make_questions(3, 30), None);

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/api/game/123456", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["pin"], "123456");
    assert_eq!(body["status"], "waiting");
    assert_eq!(body["questionCount"], 3);
    assert_eq!(body["currentQuestionIndex"], 0);

    let resp = client
        .get(format!("{}/api/game/999999", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn question_crud_requires_moderator_token() {
    let server = TestServer::new().await;
    let token = seed_game(&server.state, "123456", &make_questions(2, 30), None);
    let client = reqwest::Client::new();
    let url = format!("{}/api/games/123456/questions", server.base_url());

    // Read side is open
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["questions"].as_array().unwrap().len(), 2);

    let replacement = serde_json::json!({ "questions": make_questions(4, 60) });

    // No token / wrong token
    let resp = client.put(&url).json(&replacement).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let resp = client
        .put(&url)
        .bearer_auth("0".repeat(64))
        .json(&replacement)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Correct token replaces atomically
    let resp = client
        .put(&url)
        .bearer_auth(&token)
        .json(&replacement)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(&url).send().await.unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let questions = body["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 4);
    assert_eq!(questions[0]["timeLimit"], 60);
}

#[tokio::test]
async fn question_validation_rejected_with_400() {
    let server = TestServer::new().await;
    let token = seed_game(&server.state, "123456", &make_questions(1, 30), None);
    let client = reqwest::Client::new();
    let url = format!("{}/api/games/123456/questions", server.base_url());

    let mut bad = make_questions(1, 30);
    bad[0].time_limit_secs = 5; // below the floor
    let resp = client
        .put(&url)
        .bearer_auth(&token)
        .json(&serde_json::json!({ "questions": bad }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let three_options = serde_json::json!({ "questions": [{
        "text": "?",
        "options": ["a", "b", "c"],
        "correctIndex": 0,
        "timeLimit": 30,
    }]});
    let resp = client
        .put(&url)
        .bearer_auth(&token)
        .json(&three_options)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn question_update_conflicts_after_finish() {
    let server = TestServer::new().await;
    let token = seed_game(&server.state, "123456", &make_questions(1, 30), None);

    let mut moderator = connect_moderator(&server, "123456", &token).await;
    common::send_event(&mut moderator, &kviz_core::events::ClientEvent::EndGame {
        game_pin: "123456".to_string(),
    })
    .await;
    common::read_until(&mut moderator, |e| {
        matches!(e, kviz_core::events::ServerEvent::GameEndedDashboard(_))
    })
    .await;
    // Let the batched state write land
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let client = reqwest::Client::new();
    let resp = client
        .put(format!("{}/api/games/123456/questions", server.base_url()))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "questions": make_questions(2, 30) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn template_store_round_trip() {
    let server = TestServer::new().await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/question-templates/veda", server.base_url());

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let questions: Vec<Question> = make_questions(3, 45);
    let resp = client
        .put(&url)
        .json(&serde_json::json!({ "questions": questions }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["questions"].as_array().unwrap().len(), 3);
    assert_eq!(body["questions"][0]["timeLimit"], 45);

    // Invalid template payloads never land
    let resp = client
        .put(&url)
        .json(&serde_json::json!({ "questions": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn health_endpoints() {
    let server = TestServer::new().await;
    seed_game(&server.state, "123456", &make_questions(1, 30), None);

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/health", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");

    let resp = client
        .get(format!("{}/health/ready", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "ready");
}
