//! Reply references and the Thread/Reply Resolver
//!
//! Grammar recognised in post content (a run of two or more `>` starts a
//! reference):
//!
//! ```text
//! reference := ">>" ">"* ( url | short )
//! url       := ("http://" | "https://") authority "/" board "/" slug? ( "#" slug )?
//! short     := mirror | slug
//! mirror    := "f" authority "-" slug
//! authority := [A-Za-z0-9.\-:_\[\]]+
//! board     := [A-Za-z0-9_]+
//! slug      := [A-Za-z0-9_.\-~]+        (trailing "." is not part of the slug)
//! ```
//!
//! A URL with a fragment names the reply identified by the fragment, on the
//! same authority and board. Authorities lose a leading `www.` and every Id
//! is rebuilt with the configured transport.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

use super::activity::collect_ids;
use crate::data::{Database, id_slug};
use crate::error::AppError;

// =============================================================================
// Tokenizer
// =============================================================================

/// A reply reference before it is resolved against storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Canonical post Id
    Id(String),
    /// Bare slug, optionally qualified with the authority it came from
    Slug { host: Option<String>, slug: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Ref { raw: &'a str, reference: Reference },
}

fn is_slug_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'~')
}

fn is_authority_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'_' | b'[' | b']')
}

fn is_board_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn take_while(input: &str, accept: fn(u8) -> bool) -> usize {
    input.bytes().take_while(|b| accept(*b)).count()
}

/// Length after dropping trailing dots
fn trim_dots(token: &str) -> usize {
    token.trim_end_matches('.').len()
}

fn normalize_authority(authority: &str) -> String {
    let lower = authority.to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// `f{host}-{SLUG}` -> (host, SLUG)
fn mirror_slug(token: &str) -> Option<(String, String)> {
    let (host, slug) = token.strip_prefix('f')?.rsplit_once('-')?;
    let qualified = !host.is_empty() && (host.contains('.') || host.contains(':'));
    let valid_slug = !slug.is_empty() && slug.bytes().all(|b| b.is_ascii_alphanumeric());
    (qualified && valid_slug).then(|| (normalize_authority(host), slug.to_string()))
}

fn short_reference(token: &str) -> Option<Reference> {
    if let Some((host, slug)) = mirror_slug(token) {
        return Some(Reference::Slug {
            host: Some(host),
            slug,
        });
    }
    token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric())
        .then(|| Reference::Slug {
            host: None,
            slug: token.to_string(),
        })
}

/// Parse one reference after the `>` run; returns it with the bytes consumed
fn parse_reference(input: &str, protocol: &str) -> Option<(Reference, usize)> {
    let scheme_len = if input.starts_with("https://") {
        "https://".len()
    } else if input.starts_with("http://") {
        "http://".len()
    } else {
        let len = trim_dots(&input[..take_while(input, is_slug_byte)]);
        return short_reference(&input[..len]).map(|reference| (reference, len));
    };

    let rest = &input[scheme_len..];
    let authority_len = take_while(rest, is_authority_byte);
    if authority_len == 0 {
        return None;
    }
    let authority = normalize_authority(&rest[..authority_len]);

    let mut pos = authority_len;
    if rest.as_bytes().get(pos) != Some(&b'/') {
        return None;
    }
    pos += 1;

    let board_len = take_while(&rest[pos..], is_board_byte);
    if board_len == 0 {
        return None;
    }
    let board = &rest[pos..pos + board_len];
    pos += board_len;
    if rest.as_bytes().get(pos) != Some(&b'/') {
        return None;
    }
    pos += 1;

    let slug_start = pos;
    let slug_len = take_while(&rest[pos..], is_slug_byte);
    let mut target = &rest[slug_start..slug_start + slug_len];
    pos += slug_len;

    let fragment_len = match rest.as_bytes().get(pos) {
        Some(b'#') => {
            let after = &rest[pos + 1..];
            trim_dots(&after[..take_while(after, is_slug_byte)])
        }
        _ => 0,
    };

    if fragment_len > 0 {
        target = &rest[pos + 1..pos + 1 + fragment_len];
        pos += 1 + fragment_len;
    } else {
        let trimmed = trim_dots(target);
        pos -= target.len() - trimmed;
        target = &target[..trimmed];
    }

    if target.is_empty() {
        return None;
    }

    let reference = match mirror_slug(target) {
        Some((host, slug)) => Reference::Slug {
            host: Some(host),
            slug,
        },
        None => Reference::Id(format!("{}://{}/{}/{}", protocol, authority, board, target)),
    };
    Some((reference, scheme_len + pos))
}

/// Split content into plain text and reply references
///
/// `protocol` is the transport (`http` or `https`) used to rebuild Ids.
pub fn tokenize<'a>(content: &'a str, protocol: &str) -> Vec<Segment<'a>> {
    let bytes = content.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'>' || bytes[i + 1] != b'>' {
            i += 1;
            continue;
        }

        let mut body_start = i + 2;
        while body_start < bytes.len() && bytes[body_start] == b'>' {
            body_start += 1;
        }

        match parse_reference(&content[body_start..], protocol) {
            Some((reference, len)) => {
                if text_start < i {
                    segments.push(Segment::Text(&content[text_start..i]));
                }
                let end = body_start + len;
                segments.push(Segment::Ref {
                    raw: &content[i..end],
                    reference,
                });
                i = end;
                text_start = end;
            }
            None => i = body_start,
        }
    }

    if text_start < content.len() {
        segments.push(Segment::Text(&content[text_start..]));
    }
    segments
}

/// References in order of appearance, without duplicates
pub fn extract_references(content: &str, protocol: &str) -> Vec<Reference> {
    let mut references = Vec::new();
    for segment in tokenize(content, protocol) {
        if let Segment::Ref { reference, .. } = segment {
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
    }
    references
}

/// `host[:port]` of an Id
pub fn authority_of(id: &str) -> Option<String> {
    let url = url::Url::parse(id).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

// =============================================================================
// Resolver
// =============================================================================

/// Fetches objects from peers
#[cfg_attr(test, mockall::automock)]
pub trait RemoteObjects: Send + Sync {
    /// The object document, or `None` when the peer says it does not exist
    fn fetch_object(&self, id: &str) -> BoxFuture<'static, Result<Option<Value>, AppError>>;
}

/// How a reference renders relative to the thread being shown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkClass {
    /// The current OP or a reply inside the current thread
    LocalReply { is_op: bool },
    /// A post in another thread, linked through that thread's OP
    CrossPost { op: String },
    /// Tombstoned or gone
    Dead,
    /// Could not be checked; link straight to it
    Remote,
}

/// Reply targets derived from content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Thread the post belongs to: the given OP, or the first valid target's
    pub root: Option<String>,
    /// Valid targets inside that thread, excluding the root
    pub replies: Vec<String>,
}

impl Resolution {
    /// InReplyTo list: root first
    pub fn in_reply_to(&self) -> Vec<String> {
        self.root.iter().chain(self.replies.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone)]
struct TargetInfo {
    /// Thread root; `None` when the target is an OP
    root: Option<String>,
    tombstoned: bool,
}

pub struct ReplyResolver {
    db: Arc<Database>,
    remote: Arc<dyn RemoteObjects>,
    protocol: String,
    /// Local authority, used to shorten local Ids
    domain: String,
}

impl ReplyResolver {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteObjects>,
        protocol: String,
        domain: String,
    ) -> Self {
        Self {
            db,
            remote,
            protocol,
            domain,
        }
    }

    /// Determine the thread and the valid in-thread targets of `content`
    ///
    /// Each failing reference is logged and dropped on its own.
    pub async fn resolve(&self, content: &str, op: Option<&str>) -> Resolution {
        let mut candidates: Vec<String> = Vec::new();
        for reference in extract_references(content, &self.protocol) {
            match self.expand(&reference).await {
                Ok(Some(id)) if !candidates.contains(&id) => candidates.push(id),
                Ok(_) => {}
                Err(error) => tracing::warn!(?reference, %error, "Failed to expand reference"),
            }
        }

        let mut resolution = Resolution {
            root: op.map(str::to_string),
            replies: Vec::new(),
        };

        for candidate in candidates {
            let info = match self.lookup(&candidate).await {
                Ok(Some(info)) if !info.tombstoned => info,
                Ok(_) => {
                    tracing::debug!(%candidate, "Dropping reference to missing post");
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%candidate, %error, "Dropping unverifiable reference");
                    continue;
                }
            };

            let candidate_root = info.root.unwrap_or_else(|| candidate.clone());
            match &resolution.root {
                None => resolution.root = Some(candidate_root),
                Some(root) if *root != candidate_root => {
                    tracing::debug!(%candidate, %root, "Reference outside thread");
                    continue;
                }
                Some(_) => {}
            }

            if resolution.root.as_deref() != Some(candidate.as_str()) {
                resolution.replies.push(candidate);
            }
        }

        resolution
    }

    /// Classify `candidate` relative to the thread rooted at `op`
    pub async fn classify(&self, candidate: &str, op: &str) -> LinkClass {
        if candidate == op {
            return LinkClass::LocalReply { is_op: true };
        }
        match self.db.is_reply_in_thread(op, candidate).await {
            Ok(true) => return LinkClass::LocalReply { is_op: false },
            Ok(false) => {}
            Err(error) => tracing::warn!(%candidate, %error, "Thread membership lookup failed"),
        }

        match self.lookup(candidate).await {
            Ok(Some(info)) if info.tombstoned => LinkClass::Dead,
            Ok(Some(info)) => LinkClass::CrossPost {
                op: info.root.unwrap_or_else(|| candidate.to_string()),
            },
            Ok(None) => LinkClass::Dead,
            Err(error) => {
                tracing::debug!(%candidate, %error, "Linking unverified reference directly");
                LinkClass::Remote
            }
        }
    }

    /// Render content as HTML, turning references into anchors
    ///
    /// `board` is the short name of the board the thread is shown on.
    pub async fn render(&self, content: &str, op: &str, board: &str) -> String {
        let mut html = String::with_capacity(content.len());

        for segment in tokenize(content, &self.protocol) {
            match segment {
                Segment::Text(text) => html.push_str(&html_escape::encode_text(text)),
                Segment::Ref { raw, reference } => match self.expand(&reference).await {
                    Ok(Some(id)) => html.push_str(&self.anchor(&id, op, board).await),
                    _ => html.push_str(&html_escape::encode_text(raw)),
                },
            }
        }

        html
    }

    /// Short display form: slug for local posts, `f{host}-{slug}` otherwise
    pub fn short_id(&self, id: &str) -> String {
        let slug = id_slug(id);
        match authority_of(id) {
            Some(authority) if authority != self.domain => format!("f{}-{}", authority, slug),
            _ => slug.to_string(),
        }
    }

    async fn anchor(&self, id: &str, op: &str, board: &str) -> String {
        let short = self.short_id(id);
        match self.classify(id, op).await {
            LinkClass::LocalReply { is_op } => format!(
                "<a class=\"reply\" href=\"/{}/{}#{}\">&gt;&gt;{}{}</a>",
                board,
                self.short_id(op),
                short,
                short,
                if is_op { " (OP)" } else { "" }
            ),
            LinkClass::CrossPost { op: thread } if thread == id => format!(
                "<a class=\"reply\" href=\"{}\">&gt;&gt;{} →</a>",
                html_escape::encode_double_quoted_attribute(&thread),
                short
            ),
            LinkClass::CrossPost { op: thread } => format!(
                "<a class=\"reply\" href=\"{}#{}\">&gt;&gt;{} →</a>",
                html_escape::encode_double_quoted_attribute(&thread),
                short,
                short
            ),
            LinkClass::Dead => format!("<a class=\"reply deadlink\">&gt;&gt;{}</a>", short),
            LinkClass::Remote => format!(
                "<a class=\"reply\" href=\"{}\">&gt;&gt;{} →</a>",
                html_escape::encode_double_quoted_attribute(id),
                short
            ),
        }
    }

    /// Turn a reference into a full Id; slugs need a stored post
    async fn expand(&self, reference: &Reference) -> Result<Option<String>, AppError> {
        match reference {
            Reference::Id(id) => Ok(Some(id.clone())),
            Reference::Slug { host, slug } => {
                let found = self.db.post_id_by_slug(slug).await?;
                Ok(found.filter(|id| match host {
                    Some(host) => authority_of(id).as_deref() == Some(host.as_str()),
                    None => true,
                }))
            }
        }
    }

    /// Storage first; remote Ids fall back to the network
    async fn lookup(&self, id: &str) -> Result<Option<TargetInfo>, AppError> {
        if self.db.post_exists(id).await? {
            return Ok(Some(TargetInfo {
                root: self.db.thread_root_of(id).await?,
                tombstoned: self.db.is_tombstoned(id).await?,
            }));
        }
        if authority_of(id).as_deref() == Some(self.domain.as_str()) {
            return Ok(None);
        }

        let Some(document) = self.remote.fetch_object(id).await? else {
            return Ok(None);
        };
        let kind = document.get("type").and_then(Value::as_str).unwrap_or_default();
        if !matches!(kind, "Note" | "Tombstone" | "Page" | "Article") {
            return Ok(None);
        }

        Ok(Some(TargetInfo {
            root: document
                .get("inReplyTo")
                .map(collect_ids)
                .and_then(|ids| ids.into_iter().next()),
            tombstoned: kind == "Tombstone",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Post;
    use futures::FutureExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn ids(content: &str) -> Vec<Reference> {
        extract_references(content, "https")
    }

    fn id(s: &str) -> Reference {
        Reference::Id(s.to_string())
    }

    #[test]
    fn tokenizer_extracts_full_links() {
        assert_eq!(
            ids(">>https://www.b.example/tech/ABCDEFGH nice"),
            vec![id("https://b.example/tech/ABCDEFGH")]
        );
        // Transport is forced to the configured one
        assert_eq!(
            ids(">>http://b.example/tech/ABCDEFGH"),
            vec![id("https://b.example/tech/ABCDEFGH")]
        );
    }

    #[test]
    fn fragment_names_the_reply() {
        assert_eq!(
            ids(">>https://b.example/board/THREADOP#REPLYXYZ"),
            vec![id("https://b.example/board/REPLYXYZ")]
        );
    }

    #[test]
    fn trailing_punctuation_is_not_part_of_the_link() {
        assert_eq!(
            ids("see >>https://b.example/g/ABCDEFGH. and >>QWERTY12, ok"),
            vec![
                id("https://b.example/g/ABCDEFGH"),
                Reference::Slug {
                    host: None,
                    slug: "QWERTY12".to_string()
                }
            ]
        );
    }

    #[test]
    fn nested_quote_markers_and_greentext() {
        assert_eq!(ids(">>>https://b.example/g/ABCDEFGH"), vec![id("https://b.example/g/ABCDEFGH")]);
        assert!(ids(">implying\n> >not a ref").is_empty());
        assert!(ids(">>").is_empty());
        assert!(ids(">>https://b.example/").is_empty());
        assert!(ids(">>https://b.example/g/").is_empty());
    }

    #[test]
    fn mirror_short_form_carries_host() {
        assert_eq!(
            ids(">>fb.example-ABCDEFGH"),
            vec![Reference::Slug {
                host: Some("b.example".to_string()),
                slug: "ABCDEFGH".to_string()
            }]
        );
        assert_eq!(
            ids(">>fABC"),
            vec![Reference::Slug {
                host: None,
                slug: "fABC".to_string()
            }]
        );
    }

    #[test]
    fn duplicates_are_collapsed_and_text_preserved() {
        let content = "a >>ABCDEFGH b >>ABCDEFGH";
        assert_eq!(ids(content).len(), 1);

        let segments = tokenize(content, "https");
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0], Segment::Text("a "));
        assert!(matches!(segments[1], Segment::Ref { raw: ">>ABCDEFGH", .. }));
    }

    async fn resolver(remote: MockRemoteObjects) -> (ReplyResolver, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("r.db")).await.unwrap());
        let resolver = ReplyResolver::new(
            db.clone(),
            Arc::new(remote),
            "https".to_string(),
            "a.example".to_string(),
        );
        (resolver, db, temp_dir)
    }

    fn stored(id: &str, replies_to: &[&str]) -> Post {
        let mut post = Post::new_note(id.to_string(), "https://a.example/g".to_string());
        post.in_reply_to = replies_to.iter().map(|s| s.to_string()).collect();
        post.is_local = true;
        post
    }

    const OP: &str = "https://a.example/g/OP000000";

    #[tokio::test]
    async fn resolve_keeps_only_valid_in_thread_targets() {
        let mut remote = MockRemoteObjects::new();
        remote
            .expect_fetch_object()
            .withf(|id: &str| id == "https://b.example/t/GONE0000")
            .returning(|_| async { Ok(None) }.boxed());
        let (resolver, db, _temp_dir) = resolver(remote).await;

        db.insert_post(&stored(OP, &[])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/REPLY001", &[OP])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/OTHER000", &[])).await.unwrap();

        let content = ">>REPLY001 >>OP000000 >>OTHER000 >>https://b.example/t/GONE0000 >>NOTHERE0";
        let resolution = resolver.resolve(content, Some(OP)).await;

        assert_eq!(resolution.root.as_deref(), Some(OP));
        assert_eq!(resolution.replies, vec!["https://a.example/g/REPLY001".to_string()]);
        assert_eq!(
            resolution.in_reply_to(),
            vec![OP.to_string(), "https://a.example/g/REPLY001".to_string()]
        );
    }

    #[tokio::test]
    async fn first_valid_reference_picks_the_thread() {
        let (resolver, db, _temp_dir) = resolver(MockRemoteObjects::new()).await;
        db.insert_post(&stored(OP, &[])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/REPLY001", &[OP])).await.unwrap();

        let resolution = resolver.resolve(">>REPLY001", None).await;
        assert_eq!(resolution.root.as_deref(), Some(OP));
        assert_eq!(resolution.replies, vec!["https://a.example/g/REPLY001".to_string()]);

        assert_eq!(resolver.resolve("no links", None).await, Resolution::default());
    }

    #[tokio::test]
    async fn remote_failure_drops_only_that_reference() {
        let mut remote = MockRemoteObjects::new();
        remote
            .expect_fetch_object()
            .returning(|_| async { Err(AppError::Federation("unreachable".to_string())) }.boxed());
        let (resolver, db, _temp_dir) = resolver(remote).await;
        db.insert_post(&stored(OP, &[])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/REPLY001", &[OP])).await.unwrap();

        let resolution = resolver
            .resolve(">>https://b.example/t/ABCDEFGH >>REPLY001", Some(OP))
            .await;
        assert_eq!(resolution.replies, vec!["https://a.example/g/REPLY001".to_string()]);
    }

    #[tokio::test]
    async fn cross_post_links_through_remote_op() {
        let mut remote = MockRemoteObjects::new();
        remote
            .expect_fetch_object()
            .withf(|id: &str| id == "https://b.example/board/REPLYXYZ")
            .returning(|_| {
                async {
                    Ok(Some(json!({
                        "type": "Note",
                        "id": "https://b.example/board/REPLYXYZ",
                        "inReplyTo": [{"id": "https://b.example/board/THREADOP"}],
                    })))
                }
                .boxed()
            });
        let (resolver, db, _temp_dir) = resolver(remote).await;
        db.insert_post(&stored(OP, &[])).await.unwrap();

        let class = resolver.classify("https://b.example/board/REPLYXYZ", OP).await;
        assert_eq!(
            class,
            LinkClass::CrossPost {
                op: "https://b.example/board/THREADOP".to_string()
            }
        );

        let html = resolver
            .render(">>https://b.example/board/THREADOP#REPLYXYZ", OP, "g")
            .await;
        assert_eq!(
            html,
            "<a class=\"reply\" href=\"https://b.example/board/THREADOP#fb.example-REPLYXYZ\">&gt;&gt;fb.example-REPLYXYZ →</a>"
        );
    }

    #[tokio::test]
    async fn local_and_dead_links_render() {
        let (resolver, db, _temp_dir) = resolver(MockRemoteObjects::new()).await;
        db.insert_post(&stored(OP, &[])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/REPLY001", &[OP])).await.unwrap();
        db.insert_post(&stored("https://a.example/g/OLD00000", &[])).await.unwrap();
        db.tombstone_cascade("https://a.example/g", "https://a.example/g/OLD00000", &[], 10)
            .await
            .unwrap();

        let html = resolver
            .render("<b> >>OP000000 >>REPLY001 >>OLD00000", OP, "g")
            .await;
        assert_eq!(
            html,
            "&lt;b&gt; \
             <a class=\"reply\" href=\"/g/OP000000#OP000000\">&gt;&gt;OP000000 (OP)</a> \
             <a class=\"reply\" href=\"/g/OP000000#REPLY001\">&gt;&gt;REPLY001</a> \
             <a class=\"reply deadlink\">&gt;&gt;OLD00000</a>"
        );
    }
}
