//! Database tests

use super::*;
use chrono::{Duration, Utc};
use tempfile::TempDir;

const BOARD: &str = "https://a.example/g";

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn test_board(name: &str) -> Actor {
    let id = format!("https://a.example/{name}");
    Actor {
        id: id.clone(),
        name: name.to_string(),
        preferred_username: name.to_string(),
        summary: String::new(),
        inbox: format!("{id}/inbox"),
        outbox: format!("{id}/outbox"),
        following: format!("{id}/following"),
        followers: format!("{id}/followers"),
        public_key_pem: Some("public".to_string()),
        private_key_pem: Some("private".to_string()),
        restricted: false,
        auto_subscribe: false,
        is_instance: false,
        created_at: Utc::now(),
    }
}

fn op(slug: &str, bumped_secs_ago: i64) -> Post {
    let mut post = Post::new_note(format!("{BOARD}/{slug}"), BOARD.to_string());
    post.updated = Utc::now() - Duration::seconds(bumped_secs_ago);
    post.published = post.updated;
    post.is_local = true;
    post
}

fn reply(slug: &str, targets: &[&str]) -> Post {
    let mut post = Post::new_note(format!("{BOARD}/{slug}"), BOARD.to_string());
    post.in_reply_to = targets.iter().map(|t| format!("{BOARD}/{t}")).collect();
    post.is_local = true;
    post
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_actor_insert_is_conditional() {
    let (db, _temp_dir) = create_test_db().await;
    let board = test_board("g");

    assert!(db.insert_actor(&board).await.unwrap());
    assert!(!db.insert_actor(&board).await.unwrap());

    let loaded = db.get_actor_by_name("g").await.unwrap().unwrap();
    assert_eq!(loaded.id, board.id);
    assert!(loaded.is_local());
    assert_eq!(db.list_boards().await.unwrap().len(), 1);

    assert_eq!(db.toggle_auto_subscribe(&board.id).await.unwrap(), Some(true));
    assert_eq!(db.toggle_auto_subscribe(&board.id).await.unwrap(), Some(false));
}

#[tokio::test]
async fn test_post_insert_dedups_by_id() {
    let (db, _temp_dir) = create_test_db().await;
    let post = op("AAAAAAAA", 0);

    assert!(db.insert_post(&post).await.unwrap());
    assert!(!db.insert_post(&post).await.unwrap());

    let loaded = db.get_post(&post.id).await.unwrap().unwrap();
    assert!(loaded.is_op());
    assert!(loaded.thread_id.is_none());
}

#[tokio::test]
async fn test_reply_to_reply_is_rooted_at_op() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_post(&op("ROOT0000", 0)).await.unwrap();
    db.insert_post(&reply("REPLY001", &["ROOT0000"])).await.unwrap();

    // Targets a reply and itself: root goes first, self reference dropped
    let nested = reply("REPLY002", &["REPLY001", "REPLY002"]);
    db.insert_post(&nested).await.unwrap();

    let loaded = db.get_post(&nested.id).await.unwrap().unwrap();
    assert_eq!(
        loaded.in_reply_to,
        vec![format!("{BOARD}/ROOT0000"), format!("{BOARD}/REPLY001")]
    );
    assert_eq!(loaded.thread_id.as_deref(), Some(format!("{BOARD}/ROOT0000").as_str()));
    assert!(db
        .is_reply_in_thread(&format!("{BOARD}/ROOT0000"), &nested.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_delete_op_cascades_to_replies() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_post(&op("THREAD00", 0)).await.unwrap();
    db.insert_post(&reply("REPLY001", &["THREAD00"])).await.unwrap();
    db.insert_post(&reply("REPLY002", &["THREAD00"])).await.unwrap();

    let outcome = db
        .tombstone_cascade(BOARD, &format!("{BOARD}/THREAD00"), &[], 10)
        .await
        .unwrap();

    assert_eq!(outcome.tombstoned.len(), 3);
    for slug in ["THREAD00", "REPLY001", "REPLY002"] {
        let post = db.get_post(&format!("{BOARD}/{slug}")).await.unwrap().unwrap();
        assert!(post.tombstoned);
        assert_eq!(post.object_type, PostType::Tombstone);
        assert!(post.content.is_empty());
    }
}

#[tokio::test]
async fn test_delete_reply_leaves_thread_untouched() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_post(&op("THREAD00", 0)).await.unwrap();
    let mut r1 = reply("REPLY001", &["THREAD00"]);
    r1.content = "first".to_string();
    db.insert_post(&r1).await.unwrap();
    db.insert_post(&reply("REPLY002", &["THREAD00"])).await.unwrap();

    let outcome = db.tombstone_cascade(BOARD, &r1.id, &[], 10).await.unwrap();
    assert_eq!(outcome.tombstoned, vec![r1.id.clone()]);

    assert!(db.is_tombstoned(&r1.id).await.unwrap());
    assert!(!db.is_tombstoned(&format!("{BOARD}/THREAD00")).await.unwrap());
    assert!(!db.is_tombstoned(&format!("{BOARD}/REPLY002")).await.unwrap());
}

#[tokio::test]
async fn test_archive_rotation_and_unarchive_on_delete() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_post(&op("OLDEST00", 30)).await.unwrap();
    db.insert_post(&op("MIDDLE00", 20)).await.unwrap();
    db.insert_post(&op("NEWEST00", 10)).await.unwrap();

    let archived = db.archive_overflow(BOARD, 2).await.unwrap();
    assert_eq!(archived, vec![format!("{BOARD}/OLDEST00")]);
    assert_eq!(db.list_threads(BOARD).await.unwrap().len(), 2);

    // Deleting a live thread frees one slot; the archived thread returns
    let outcome = db
        .tombstone_cascade(BOARD, &format!("{BOARD}/NEWEST00"), &[], 2)
        .await
        .unwrap();
    assert_eq!(outcome.unarchived, Some(format!("{BOARD}/OLDEST00")));

    let live: Vec<String> = db
        .list_threads(BOARD)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(live, vec![format!("{BOARD}/MIDDLE00"), format!("{BOARD}/OLDEST00")]);
}

#[tokio::test]
async fn test_stickies_are_exempt_from_archive() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_post(&op("STICKY00", 100)).await.unwrap();
    db.insert_post(&op("PLAIN000", 10)).await.unwrap();
    db.insert_post(&op("PLAIN001", 5)).await.unwrap();
    assert_eq!(db.toggle_sticky(&format!("{BOARD}/STICKY00")).await.unwrap(), Some(true));

    let archived = db.archive_overflow(BOARD, 2).await.unwrap();
    assert_eq!(archived, vec![format!("{BOARD}/PLAIN000")]);

    let threads = db.list_threads(BOARD).await.unwrap();
    assert_eq!(threads[0].id, format!("{BOARD}/STICKY00"));
}

#[tokio::test]
async fn test_follow_pair_is_unique() {
    let (db, _temp_dir) = create_test_db().await;
    let follower = "https://b.example/t";

    assert!(db
        .upsert_follower(follower, BOARD, "https://b.example/t/inbox", None)
        .await
        .unwrap());
    assert!(!db
        .upsert_follower(follower, BOARD, "https://b.example/t/inbox", None)
        .await
        .unwrap());

    assert_eq!(db.list_followers(BOARD).await.unwrap(), vec![follower.to_string()]);
    assert_eq!(
        db.get_follower_inboxes(BOARD).await.unwrap(),
        vec!["https://b.example/t/inbox".to_string()]
    );
}

#[tokio::test]
async fn test_pending_follow_lifecycle() {
    let (db, _temp_dir) = create_test_db().await;
    let target = "https://b.example/t";

    assert!(db
        .insert_pending_follow(BOARD, target, "https://b.example/t/inbox", "https://a.example/g/F1")
        .await
        .unwrap());
    // At most one pending record per pair
    assert!(!db
        .insert_pending_follow(BOARD, target, "https://b.example/t/inbox", "https://a.example/g/F2")
        .await
        .unwrap());
    assert!(db.list_following(BOARD).await.unwrap().is_empty());

    assert!(db.accept_follow(BOARD, target).await.unwrap());
    let relation = db.get_follow(BOARD, target).await.unwrap().unwrap();
    assert_eq!(relation.state, FollowState::Accepted);
    assert_eq!(db.list_following(BOARD).await.unwrap(), vec![target.to_string()]);

    // Accepted records are not cleared by a late Reject
    assert!(!db.clear_pending_follow(BOARD, target).await.unwrap());
    assert!(db.remove_follow(BOARD, target).await.unwrap());
}

#[tokio::test]
async fn test_inbound_activity_recorded_once() {
    let (db, _temp_dir) = create_test_db().await;
    let id = "https://b.example/activities/1";

    assert!(db.record_inbound_activity(id, "Create", "https://b.example/t").await.unwrap());
    assert!(!db.record_inbound_activity(id, "Create", "https://b.example/t").await.unwrap());

    db.forget_inbound_activity(id).await.unwrap();
    assert!(db.record_inbound_activity(id, "Create", "https://b.example/t").await.unwrap());
}

#[tokio::test]
async fn test_captcha_consume_replaces_code() {
    let (db, _temp_dir) = create_test_db().await;
    db.insert_captcha("tok1", "ABCD").await.unwrap();

    let code = db.consume_captcha("tok1", ("tok2", "WXYZ")).await.unwrap();
    assert_eq!(code.as_deref(), Some("ABCD"));
    assert_eq!(db.consume_captcha("tok1", ("tok3", "QQQQ")).await.unwrap(), None);
    assert_eq!(db.count_captchas().await.unwrap(), 1);
}

#[tokio::test]
async fn test_blacklist_crud() {
    let (db, _temp_dir) = create_test_db().await;

    let id = db.add_blacklist_pattern("spam.*").await.unwrap().unwrap();
    assert!(db.add_blacklist_pattern("spam.*").await.unwrap().is_none());
    assert_eq!(db.list_blacklist().await.unwrap().len(), 1);

    assert!(db.remove_blacklist_pattern(id).await.unwrap());
    assert!(db.list_blacklist().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slug_lookup_prefers_local() {
    let (db, _temp_dir) = create_test_db().await;
    let mut remote = Post::new_note("https://b.example/t/SAMESLUG".into(), "https://b.example/t".into());
    remote.is_local = false;
    db.insert_post(&remote).await.unwrap();
    db.insert_post(&op("SAMESLUG", 0)).await.unwrap();

    assert_eq!(
        db.post_id_by_slug("SAMESLUG").await.unwrap(),
        Some(format!("{BOARD}/SAMESLUG"))
    );
    assert_eq!(db.post_id_by_slug("MISSING0").await.unwrap(), None);
}

#[tokio::test]
async fn test_tripcode_and_media_columns() {
    let (db, _temp_dir) = create_test_db().await;
    let mut post = op("TRIPCODE", 0);
    post.tripcode = "!AbCdEfGhIj".to_string();
    post.media_href = Some("https://a.example/public/x.png".to_string());
    post.media_type = Some("image/png".to_string());
    db.insert_post(&post).await.unwrap();

    let stored = db.get_post(&post.id).await.unwrap().unwrap();
    assert_eq!(stored.tripcode, "!AbCdEfGhIj");
    assert!(!stored.sensitive);

    assert!(db.mark_sensitive(&post.id).await.unwrap());
    assert_eq!(
        db.clear_attachment(&post.id).await.unwrap().as_deref(),
        Some("https://a.example/public/x.png")
    );
    assert_eq!(db.clear_attachment(&post.id).await.unwrap(), None);

    let stored = db.get_post(&post.id).await.unwrap().unwrap();
    assert!(stored.sensitive);
    assert!(stored.media_href.is_none());
    assert!(stored.media_type.is_none());
}

#[tokio::test]
async fn test_bans_expire() {
    let (db, _temp_dir) = create_test_db().await;
    let post = op("BANNEDOP", 0);
    db.insert_post(&post).await.unwrap();
    db.store_poster_hash(&post.id, "hash-a").await.unwrap();
    assert_eq!(db.get_poster_hash(&post.id).await.unwrap().as_deref(), Some("hash-a"));

    let now = Utc::now();
    let short = db.insert_ban("hash-a", "spam", now + Duration::days(1)).await.unwrap();
    db.insert_ban("hash-b", "old", now - Duration::days(1)).await.unwrap();

    assert_eq!(db.active_ban("hash-a", now).await.unwrap().map(|b| b.id), Some(short));
    assert!(db.active_ban("hash-b", now).await.unwrap().is_none());
    assert!(db.active_ban("hash-a", now + Duration::days(2)).await.unwrap().is_none());
    assert_eq!(db.list_bans(now).await.unwrap().len(), 1);

    assert!(db.remove_ban(short).await.unwrap());
    assert!(!db.remove_ban(short).await.unwrap());
}

#[tokio::test]
async fn test_reports_are_per_board() {
    let (db, _temp_dir) = create_test_db().await;
    let id = db.insert_report(&format!("{BOARD}/OP"), BOARD, "spam").await.unwrap();

    assert_eq!(db.list_reports(BOARD).await.unwrap().len(), 1);
    assert!(db.list_reports("https://a.example/v").await.unwrap().is_empty());
    assert!(!db.delete_report("https://a.example/v", id).await.unwrap());
    assert!(db.delete_report(BOARD, id).await.unwrap());
    assert!(db.list_reports(BOARD).await.unwrap().is_empty());
}
