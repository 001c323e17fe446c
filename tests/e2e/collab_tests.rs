//! Collaborative editing channel: clients joined to a view's collab room
//! receive update events when a row changes underneath an open edit view.
//! Row changes go through the REST API; updates arrive as
//! `<view>_UPDATE_EVENT?id=<row>` events.

use anyhow::Result;
use saltcorn_sectest::{HttpSession, RealtimeClient};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

use crate::common::{login, Suite, ADMIN_EMAIL, ADMIN_PASSWORD};

const COLLAB_VIEW: &str = "authoredit";
const SETTLE: Duration = Duration::from_secs(1);

struct CollabActor {
    sess: HttpSession,
    client: RealtimeClient,
    update_event: String,
}

impl CollabActor {
    async fn join(suite: &Suite, row_id: u32) -> Result<Self> {
        let mut sess = suite.session()?;
        login(&mut sess, ADMIN_EMAIL, ADMIN_PASSWORD).await?;
        let cookie = sess.session_cookie();
        let mut client = RealtimeClient::connect(&suite.ws_url(), cookie.as_deref()).await?;
        let update_event = format!("{COLLAB_VIEW}_UPDATE_EVENT?id={row_id}");
        client.subscribe(&update_event);
        client
            .join_room("join_collab_room", json!(COLLAB_VIEW))
            .await?;
        Ok(Self {
            sess,
            client,
            update_event,
        })
    }

    async fn update_row(&mut self, table: &str, row_id: u32, author: &str, pages: u32) -> Result<()> {
        self.sess.get(&format!("/view/{COLLAB_VIEW}?id={row_id}")).await?;
        let csrf = self.sess.csrf();
        let pages = pages.to_string();
        self.sess
            .post_form(
                &format!("/api/{table}/{row_id}"),
                &[("author", author), ("pages", &pages), ("_csrf", &csrf)],
            )
            .await
    }

    fn updates(&self) -> Vec<serde_json::Value> {
        self.client.events(&self.update_event)
    }

    async fn disconnect(self) {
        self.client.close().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a saltcorn binary and database"]
async fn client_connects_and_joins_collab_room() -> Result<()> {
    let suite = Suite::boot().await?;
    let actor = CollabActor::join(&suite, 1).await?;
    sleep(SETTLE).await;
    actor.disconnect().await;
    suite.teardown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a saltcorn binary and database"]
async fn row_update_is_broadcast_to_the_room() -> Result<()> {
    let suite = Suite::boot().await?;
    let mut actor = CollabActor::join(&suite, 1).await?;

    actor.update_row("books", 1, "New Author", 213).await?;
    sleep(SETTLE).await;
    let updates = actor.updates();
    assert!(!updates.is_empty());
    assert_eq!(updates[0]["updates"]["author"], json!("New Author"));

    actor.disconnect().await;
    suite.teardown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a saltcorn binary and database"]
async fn unchanged_rows_do_not_emit_updates() -> Result<()> {
    let suite = Suite::boot().await?;
    let mut actor = CollabActor::join(&suite, 1).await?;

    actor.update_row("books", 1, "MisterJ", 213).await?;
    sleep(SETTLE).await;
    assert_eq!(actor.updates().len(), 1);

    // Submitting identical values must not produce a second event.
    actor.update_row("books", 1, "MisterJ", 213).await?;
    sleep(SETTLE).await;
    assert_eq!(actor.updates().len(), 1);

    actor.disconnect().await;
    suite.teardown().await;
    Ok(())
}
