/*!
 * Duet Quick Start
 *
 * One walk through the library: a file-backed store, a signed-in admin
 * publishing to the posts feed, a second reader following along over the
 * push channel, likes on a post, and reopening the file afterwards.
 */

use std::sync::Arc;

use duet::domain::{self, Post, POSTS_TABLE};
use duet::likes::LIKES_TABLE;
use duet::{
    Fields, IdentityContext, LikeState, LikeTracker, RemoteStore, Role, SessionEvent, SqliteStore, ToggleOutcome,
    ViewConfig,
};
use serde_json::json;
use tempfile::TempDir;

fn post(text: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("content_text".to_string(), json!(text));
    fields.insert("media_urls".to_string(), json!([]));
    fields
}

#[test]
fn quick_start() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();

    let dir = TempDir::new()?;
    let path = dir.path().join("duet.db");
    let store: Arc<dyn RemoteStore> = Arc::new(
        SqliteStore::builder()
            .path(&path)
            .unique(LIKES_TABLE, &["post_id", "owner_id"])
            .build()?,
    );

    // The admin's session: signed in first, role known once the profile loads.
    let admin = IdentityContext::anonymous();
    admin.apply(&SessionEvent::SignedIn { user_id: "admin".to_string() });
    admin.apply(&SessionEvent::ProfileLoaded { role: Role::from_profile_role(Some("admin")) });

    let mut editor = domain::posts_feed().open(store.clone(), admin.clone());
    let mut reader = domain::posts_feed().open(store.clone(), IdentityContext::signed_in("maria", Role::Standard));
    editor.mount()?;
    reader.mount()?;

    let first = editor.create(post("Buenos días, amor"))?;
    let second = editor.create(post("Te extraño"))?;
    let posts: Vec<Post> = editor.decoded()?;
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].id, second.id);

    assert_eq!(reader.pump_events()?, 2);
    assert_eq!(reader.rendered(), editor.rendered());

    // Readers may not publish.
    assert!(reader.create(post("hola")).is_err());

    let likes = LikeTracker::new(store.clone(), IdentityContext::signed_in("maria", Role::Standard), &first.id);
    likes.mount()?;
    assert_eq!(likes.toggle()?, ToggleOutcome::Liked);
    assert_eq!(likes.state(), LikeState { liked: true, count: 1 });

    editor.remove(&second.id)?;
    reader.pump_events()?;
    assert_eq!(reader.rendered().len(), 1);

    // A screen defined in JSON sees the same rows after reopening the file.
    drop(likes);
    drop(editor);
    drop(reader);
    drop(store);
    let reopened: Arc<dyn RemoteStore> = Arc::new(SqliteStore::open(&path)?);
    let config = ViewConfig::from_json(&format!(
        r#"{{"table": "{}", "order": [{{"field": "created_at", "descending": true}}]}}"#,
        POSTS_TABLE
    ))?;
    let mut view = duet::ReconciledView::new(reopened.clone(), IdentityContext::anonymous(), config);
    view.load()?;
    assert_eq!(view.rendered().len(), 1);
    assert_eq!(view.rendered()[0].id, first.id);
    assert_eq!(reopened.count(LIKES_TABLE, &duet::Filter::all())?, 1);
    Ok(())
}
