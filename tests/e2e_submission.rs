//! E2E tests for the post submission pipeline

mod common;

use common::{ACTIVITY_JSON, PNG, Peer, TestServer};
use serde_json::{Value, json};

async fn error_of(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_new_thread_is_stored_and_published() {
    let server = TestServer::new().await;
    let peer = Peer::new().await;
    let board = server.url("/g");

    peer.send(&server.url("/g/inbox"), &peer.activity("Follow", json!(board), &[&board]))
        .await;
    peer.expect_received("Accept").await;

    let captcha = server.captcha().await;
    let response = server
        .submit("g", &[("comment", "hello"), ("captcha", captcha.as_str())], Some(PNG))
        .await;
    assert_eq!(response.status(), 200);
    let post_id = response.text().await.unwrap();
    assert!(post_id.starts_with(&format!("{}/", board)));

    let post = server.state.db.get_post(&post_id).await.unwrap().unwrap();
    assert!(post.in_reply_to.is_empty());
    assert_eq!(post.content, "hello");
    assert_eq!(post.media_type.as_deref(), Some("image/png"));

    let create = peer.expect_received("Create").await;
    assert_eq!(create["actor"], board);
    assert_eq!(create["object"]["id"], post_id);

    let outbox: Value = server
        .client
        .get(server.url("/g/outbox"))
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outbox["totalItems"], 1);
    assert_eq!(outbox["totalImgs"], 1);
    assert_eq!(outbox["orderedItems"][0]["id"], post_id);

    let media = server
        .client
        .get(post.media_href.unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(media.status(), 200);
    assert_eq!(media.bytes().await.unwrap().as_ref(), PNG);
}

#[tokio::test]
async fn test_reply_response_names_thread_and_post() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;

    let captcha = server.captcha().await;
    let response = server
        .submit(
            "g",
            &[("inReplyTo", thread.as_str()), ("comment", "first"), ("captcha", captcha.as_str())],
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    let (op, reply) = body.split_once('|').unwrap();
    assert_eq!(op, thread);

    let stored = server.state.db.get_post(reply).await.unwrap().unwrap();
    assert_eq!(stored.in_reply_to, vec![thread.clone()]);

    // The thread document embeds the reply
    let document: Value = server
        .client
        .get(&thread)
        .header("Accept", ACTIVITY_JSON)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let replies = document["replies"]["orderedItems"].as_array().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], reply);
}

#[tokio::test]
async fn test_reply_in_same_thread_links_locally() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let first = server.reply("g", &thread, "first").await;
    let slug = first.rsplit('/').next().unwrap().to_string();

    let second = server
        .reply("g", &thread, &format!(">>{} agreed", slug))
        .await;
    let stored = server.state.db.get_post(&second).await.unwrap().unwrap();
    assert_eq!(stored.in_reply_to, vec![thread.clone(), first.clone()]);

    let html = server
        .client
        .get(&thread)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(html.contains(&format!("#{}\"", slug)));
}

#[tokio::test]
async fn test_form_submission_is_accepted() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    let response = server
        .client
        .post(server.url("/g/outbox"))
        .form(&[
            ("inReplyTo", thread.as_str()),
            ("comment", "plain form"),
            ("captcha", captcha.as_str()),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().starts_with(&format!("{}|", thread)));
}

#[tokio::test]
async fn test_captcha_is_single_use() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    let fields = [("inReplyTo", thread.as_str()), ("comment", "once"), ("captcha", captcha.as_str())];
    assert_eq!(server.submit("g", &fields, None).await.status(), 200);

    let response = server.submit("g", &fields, None).await;
    assert_eq!(response.status(), 403);
    assert_eq!(error_of(response).await, "Incorrect captcha");
}

#[tokio::test]
async fn test_missing_captcha() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;

    let response = server
        .submit("g", &[("inReplyTo", thread.as_str()), ("comment", "no captcha")], None)
        .await;
    assert_eq!(response.status(), 403);
    assert_eq!(error_of(response).await, "No captcha provided");
}

#[tokio::test]
async fn test_rejection_reasons() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    // New thread without media
    let response = server
        .submit("g", &[("comment", "text only"), ("captcha", captcha.as_str())], None)
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(error_of(response).await, "Media is required for new threads.");

    // Empty reply
    let response = server
        .submit("g", &[("inReplyTo", thread.as_str()), ("captcha", captcha.as_str())], None)
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(error_of(response).await, "Subject or Comment is required");

    // Unknown thread
    let missing = server.url("/g/NOSUCHPOST");
    let response = server
        .submit("g", &[("inReplyTo", missing.as_str()), ("comment", "x"), ("captcha", captcha.as_str())], None)
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        error_of(response).await,
        format!("\"{}\" is not a valid thread on this server", missing)
    );

    // Unsupported file type
    let response = server
        .submit(
            "g",
            &[("comment", "gif"), ("captcha", captcha.as_str())],
            Some(&b"GIF89a\x01\x00\x01\x00"[..]),
        )
        .await;
    assert_eq!(response.status(), 403);
    assert_eq!(error_of(response).await, "file type not supported");

    // None of the failures above consumed the captcha
    let response = server
        .submit("g", &[("inReplyTo", thread.as_str()), ("comment", "ok"), ("captcha", captcha.as_str())], None)
        .await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_oversized_attachment() {
    let server = TestServer::new().await;
    let captcha = server.captcha().await;
    let mut data = PNG.to_vec();
    data.resize(1024 * 1024 + 1, 0);

    let response = server
        .submit("g", &[("comment", "big"), ("captcha", captcha.as_str())], Some(data.as_slice()))
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(error_of(response).await, "File too large, maximum file size is 1 MB");
}

#[tokio::test]
async fn test_configured_blacklist() {
    let server = TestServer::with_config(|config| {
        config.posting.blacklist = vec!["casino".to_string()];
    })
    .await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    let response = server
        .submit(
            "g",
            &[("inReplyTo", thread.as_str()), ("comment", "best online casino here"), ("captcha", captcha.as_str())],
            None,
        )
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(error_of(response).await, "Comment contains blacklisted content");
}

#[tokio::test]
async fn test_failed_delivery_does_not_fail_submission() {
    let server = TestServer::new().await;
    let peer = Peer::new().await;
    let board = server.url("/g");

    peer.send(&server.url("/g/inbox"), &peer.activity("Follow", json!(board), &[&board]))
        .await;
    peer.expect_received("Accept").await;
    peer.fail_inbox();

    let thread = server.new_thread("g", "still stored").await;
    assert!(server.state.db.post_exists(&thread).await.unwrap());
}

#[tokio::test]
async fn test_self_delete_with_password() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    let response = server
        .submit(
            "g",
            &[
                ("inReplyTo", thread.as_str()),
                ("comment", "regret"),
                ("options", "delete:hunter2"),
                ("captcha", captcha.as_str()),
            ],
            None,
        )
        .await;
    let body = response.text().await.unwrap();
    let (_, reply) = body.split_once('|').unwrap();
    let slug = reply.rsplit('/').next().unwrap();

    let wrong = server
        .client
        .post(server.url("/g/delete"))
        .form(&[("id", slug), ("pwd", "guess")])
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 403);
    assert!(!server.state.db.is_tombstoned(reply).await.unwrap());

    let right = server
        .client
        .post(server.url("/g/delete"))
        .form(&[("id", slug), ("pwd", "hunter2")])
        .send()
        .await
        .unwrap();
    assert_eq!(right.status(), 200);
    assert!(server.state.db.is_tombstoned(reply).await.unwrap());
    assert!(!server.state.db.is_tombstoned(&thread).await.unwrap());
}

#[tokio::test]
async fn test_file_alone_only_suffices_for_replies() {
    let server = TestServer::new().await;
    let captcha = server.captcha().await;

    let response = server
        .submit("g", &[("captcha", captcha.as_str())], Some(PNG))
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(error_of(response).await, "Subject or Comment is required");

    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;
    let response = server
        .submit("g", &[("inReplyTo", thread.as_str()), ("captcha", captcha.as_str())], Some(PNG))
        .await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_tripcode_is_shown_without_secret() {
    let server = TestServer::new().await;
    let thread = server.new_thread("g", "op").await;
    let captcha = server.captcha().await;

    let response = server
        .submit(
            "g",
            &[
                ("inReplyTo", thread.as_str()),
                ("name", "Anon#hunter2"),
                ("comment", "signed"),
                ("captcha", captcha.as_str()),
            ],
            None,
        )
        .await;
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    let (_, reply) = body.split_once('|').unwrap();

    let stored = server.state.db.get_post(reply).await.unwrap().unwrap();
    assert_eq!(stored.attributed_to, "Anon");
    assert!(stored.tripcode.starts_with('!'));

    let html = server
        .client
        .get(&thread)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(html.contains(&stored.tripcode));
    assert!(!html.contains("hunter2"));
}
