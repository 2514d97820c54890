use std::{future::Future, sync::Arc};

use sqlx::SqliteConnection;

use crate::{
    core::{
        db::{self, DrawDb},
        graph::{EdgeGraph, PickPlan},
        lock::SessionLocks,
        participant::{Participant, ParticipantRef, Picker, Recipient},
        settings::Settings,
    },
    error::{Error, Result},
};

/// Draws recipients and repairs the assignment graph.
///
/// Every pick and removal runs under its session's lock and inside a single
/// transaction: the participants are read, the edges planned and checked on an
/// in-memory copy, and only then written.
pub struct DrawEngine {
    db: Arc<DrawDb>,
    locks: SessionLocks,
    settings: Arc<Settings>,
}

fn plan_pick(graph: &EdgeGraph, picker: i64) -> Result<PickPlan> {
    graph.plan_pick(picker, &mut rand::thread_rng())
}

impl DrawEngine {
    pub fn new(db: Arc<DrawDb>, settings: Arc<Settings>) -> Self {
        DrawEngine {
            db,
            locks: SessionLocks::new(),
            settings,
        }
    }

    pub fn db(&self) -> &DrawDb {
        &self.db
    }

    /// Run `op`, retrying a bounded number of times while the session is busy.
    async fn retry_busy<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_busy() && attempt < self.settings.busy_retries() => {
                    attempt += 1;
                    log::warn!(
                        "{} is busy, retrying ({}/{})",
                        what,
                        attempt,
                        self.settings.busy_retries()
                    );
                    tokio::time::sleep(self.settings.retry_backoff() * attempt).await;
                }
                res => return res,
            }
        }
    }

    /// Draw a recipient for `picker` in `session_id`.
    ///
    /// A picker without an ID is looked up by email and registered if unknown.
    pub async fn pick(&self, session_id: i64, picker: &Picker) -> Result<Recipient> {
        self.retry_busy("Pick", move || self.try_pick(session_id, picker))
            .await
    }

    async fn try_pick(&self, session_id: i64, picker: &Picker) -> Result<Recipient> {
        let guard = self
            .locks
            .acquire(session_id, self.settings.lock_timeout())
            .await?;
        let res = self.pick_locked(session_id, picker).await;
        drop(guard);
        self.locks.forget(session_id);
        res
    }

    async fn pick_locked(&self, session_id: i64, picker: &Picker) -> Result<Recipient> {
        let mut tx = self.db.begin().await?;

        let session = db::fetch_session(&mut *tx, session_id)
            .await?
            .ok_or(Error::SessionNotFound(session_id))?;
        if !session.is_active {
            return Err(Error::SessionNotActive(session_id));
        }

        let picker = resolve_picker(&mut *tx, session_id, picker).await?;
        if picker.has_picked {
            return Err(Error::AlreadyPicked(picker.name));
        }

        let participants = db::fetch_session_participants(&mut *tx, session_id).await?;
        let graph = EdgeGraph::from_participants(&participants)?;
        let plan = plan_pick(&graph, picker.id)?;
        let drawn = graph.apply(&plan.writes, None)?;

        for write in &plan.writes {
            db::update_participant_edges(&mut *tx, write.giver, write.target).await?;
        }

        let recipient = participants
            .iter()
            .find(|p| p.id == plan.recipient)
            .map(Participant::public_identity)
            .ok_or_else(|| Error::integrity(format!("recipient {} vanished", plan.recipient)))?;

        tx.commit().await?;

        if let Some(giver) = plan.rerouted {
            log::info!(
                "{} picked in session {} after rerouting participant {}",
                picker.email,
                session_id,
                giver
            );
        } else {
            log::info!("{} picked in session {}", picker.email, session_id);
        }
        if drawn.is_complete() {
            log::info!("Everyone in session {} has a recipient", session_id);
        }
        Ok(recipient)
    }

    /// Who `participant` gives to, or `None` if unknown or not picked yet.
    pub async fn get_assignment(
        &self,
        session_id: i64,
        participant: &ParticipantRef,
    ) -> Result<Option<Recipient>> {
        self.retry_busy("Lookup", move || {
            self.db.get_assignment(session_id, participant)
        })
        .await
    }

    /// Remove a participant, splicing its giver onto its target first.
    pub async fn remove_participant(&self, participant_id: i64) -> Result<()> {
        self.retry_busy("Removal", move || self.try_remove(participant_id))
            .await
    }

    async fn try_remove(&self, participant_id: i64) -> Result<()> {
        let session_id = self
            .db
            .get_participant(participant_id)
            .await?
            .ok_or_else(|| Error::ParticipantNotFound(format!("#{}", participant_id)))?
            .session_id;

        let guard = self
            .locks
            .acquire(session_id, self.settings.lock_timeout())
            .await?;
        let res = self.remove_locked(session_id, participant_id).await;
        drop(guard);
        self.locks.forget(session_id);
        res
    }

    async fn remove_locked(&self, session_id: i64, participant_id: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;

        // It may have been removed while we waited for the lock.
        match db::fetch_participant(&mut *tx, participant_id).await? {
            Some(p) if p.session_id == session_id => {}
            _ => return Err(Error::ParticipantNotFound(format!("#{}", participant_id))),
        }

        let participants = db::fetch_session_participants(&mut *tx, session_id).await?;
        let graph = EdgeGraph::from_participants(&participants)?;
        let plan = graph.plan_removal(participant_id)?;
        graph.apply(&plan.writes, Some(participant_id))?;

        for write in &plan.writes {
            db::update_participant_edges(&mut *tx, write.giver, write.target).await?;
        }
        db::delete_participant_row(&mut *tx, participant_id).await?;

        tx.commit().await?;

        log::info!(
            "Removed participant {} from session {} (giver {:?}, target {:?})",
            participant_id,
            session_id,
            plan.giver,
            plan.target
        );
        Ok(())
    }
}

async fn resolve_picker(
    conn: &mut SqliteConnection,
    session_id: i64,
    picker: &Picker,
) -> Result<Participant> {
    match picker.id {
        Some(id) => db::fetch_participant(conn, id)
            .await?
            .filter(|p| p.session_id == session_id)
            .ok_or_else(|| Error::ParticipantNotFound(format!("#{}", id))),
        None => match db::fetch_participant_by_email(&mut *conn, session_id, &picker.email).await? {
            Some(participant) => Ok(participant),
            None => db::insert_participant(conn, session_id, &picker.name, &picker.email).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::future::join_all;

    use super::*;
    use crate::core::db::tests::temp_db;

    async fn engine(settings: impl FnOnce(&mut Settings)) -> (tempfile::TempDir, Arc<DrawEngine>) {
        let (dir, settings, db) = temp_db(settings).await;
        (
            dir,
            Arc::new(DrawEngine::new(Arc::new(db), Arc::new(settings))),
        )
    }

    async fn session_with(engine: &DrawEngine, names: &[&str]) -> (i64, Vec<Participant>) {
        let session = engine.db().create_session("Test", 8).await.unwrap();
        let mut participants = Vec::new();
        for name in names {
            participants.push(
                engine
                    .db()
                    .join_session(session.id, name, &format!("{}@example.com", name))
                    .await
                    .unwrap(),
            );
        }
        (session.id, participants)
    }

    fn picker(p: &Participant) -> Picker {
        Picker {
            id: Some(p.id),
            name: p.name.clone(),
            email: p.email.clone(),
        }
    }

    fn newcomer(name: &str, email: &str) -> Picker {
        Picker {
            id: None,
            name: name.to_owned(),
            email: email.to_owned(),
        }
    }

    async fn graph_of(engine: &DrawEngine, session_id: i64) -> EdgeGraph {
        let participants = engine.db().list_participants(session_id).await.unwrap();
        EdgeGraph::from_participants(&participants).unwrap()
    }

    /// Write edges directly, bypassing the planner.
    async fn link(engine: &DrawEngine, edges: &[(i64, i64)]) {
        let mut tx = engine.db().begin().await.unwrap();
        for &(giver, target) in edges {
            db::update_participant_edges(&mut *tx, giver, Some(target))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_draw() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, people) = session_with(&engine, &["a", "b", "c", "d"]).await;

        for p in &people {
            let recipient = engine.pick(session_id, &picker(p)).await.unwrap();
            assert_ne!(recipient.email, p.email);
        }

        assert!(graph_of(&engine, session_id).await.is_complete());

        let mut received: Vec<String> = Vec::new();
        for p in &people {
            let first = engine
                .get_assignment(session_id, &ParticipantRef::Email(p.email.clone()))
                .await
                .unwrap()
                .unwrap();
            let second = engine
                .get_assignment(session_id, &ParticipantRef::Id(p.id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(first, second);
            received.push(first.email);
        }
        received.sort();
        assert_eq!(
            received,
            vec!["a@example.com", "b@example.com", "c@example.com", "d@example.com"]
        );
    }

    #[tokio::test]
    async fn test_pick_registers_unknown_picker() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, _) = session_with(&engine, &["a", "b"]).await;

        let recipient = engine
            .pick(session_id, &newcomer("Carol", "carol@example.com"))
            .await
            .unwrap();
        assert_ne!(recipient.email, "carol@example.com");

        let carol = engine
            .db()
            .find_participant_by_email(session_id, "carol@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(carol.has_picked);

        assert!(matches!(
            engine
                .pick(session_id, &newcomer("Carol", "carol@example.com"))
                .await,
            Err(Error::AlreadyPicked(_))
        ));
    }

    #[tokio::test]
    async fn test_pick_preconditions() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, people) = session_with(&engine, &["a"]).await;
        let (other_session, others) = session_with(&engine, &["x", "y"]).await;

        assert!(matches!(
            engine.pick(session_id, &picker(&people[0])).await,
            Err(Error::NoParticipantsAvailable)
        ));
        assert!(!graph_of(&engine, session_id).await.has_picked(people[0].id));

        assert!(matches!(
            engine.pick(session_id, &picker(&others[0])).await,
            Err(Error::ParticipantNotFound(_))
        ));
        assert!(matches!(
            engine.pick(999, &picker(&people[0])).await,
            Err(Error::SessionNotFound(999))
        ));

        engine
            .db()
            .set_session_active(other_session, false)
            .await
            .unwrap();
        assert!(matches!(
            engine.pick(other_session, &picker(&others[0])).await,
            Err(Error::SessionNotActive(_))
        ));
        assert!(matches!(
            engine
                .pick(other_session, &newcomer("Zed", "zed@example.com"))
                .await,
            Err(Error::SessionNotActive(_))
        ));
        assert!(engine
            .db()
            .find_participant_by_email(other_session, "zed@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_late_joiner_is_swapped_in() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, people) = session_with(&engine, &["a", "b"]).await;

        engine.pick(session_id, &picker(&people[0])).await.unwrap();
        engine.pick(session_id, &picker(&people[1])).await.unwrap();
        assert!(graph_of(&engine, session_id).await.is_complete());

        let recipient = engine
            .pick(session_id, &newcomer("c", "c@example.com"))
            .await
            .unwrap();
        assert_ne!(recipient.email, "c@example.com");

        let graph = graph_of(&engine, session_id).await;
        assert_eq!(graph.untargeted().count(), 0);
        assert!(graph.is_complete());
    }

    #[tokio::test]
    async fn test_remove_relinks_chain() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, people) = session_with(&engine, &["a", "b", "c"]).await;
        let (a, b, c) = (&people[0], &people[1], &people[2]);

        // b -> a -> c
        link(&engine, &[(a.id, c.id), (b.id, a.id)]).await;
        engine.remove_participant(a.id).await.unwrap();

        assert!(engine.db().get_participant(a.id).await.unwrap().is_none());
        assert_eq!(
            engine
                .get_assignment(session_id, &ParticipantRef::Id(b.id))
                .await
                .unwrap(),
            Some(c.public_identity())
        );

        let graph = graph_of(&engine, session_id).await;
        assert_eq!(graph.giver_of(c.id), Some(b.id));

        assert!(matches!(
            engine.remove_participant(a.id).await,
            Err(Error::ParticipantNotFound(_))
        ));

        // c can still finish the draw.
        engine.pick(session_id, &picker(c)).await.unwrap();
        assert!(graph_of(&engine, session_id).await.is_complete());
    }

    #[tokio::test]
    async fn test_remove_unpicked_frees_giver() {
        let (_dir, engine) = engine(|_| {}).await;
        let (session_id, people) = session_with(&engine, &["a", "b", "c"]).await;
        let (a, b, c) = (&people[0], &people[1], &people[2]);

        link(&engine, &[(b.id, a.id)]).await;
        engine.remove_participant(a.id).await.unwrap();

        let b_row = engine.db().get_participant(b.id).await.unwrap().unwrap();
        assert!(!b_row.has_picked);
        assert_eq!(b_row.assigned_to, None);

        engine.pick(session_id, &picker(b)).await.unwrap();
        engine.pick(session_id, &picker(c)).await.unwrap();
        assert!(graph_of(&engine, session_id).await.is_complete());
    }

    #[tokio::test]
    async fn test_busy_session() {
        let (_dir, engine) = engine(|s| {
            s.lock_timeout_ms = Some(20);
            s.busy_retries = Some(1);
            s.retry_backoff_ms = Some(1);
        })
        .await;
        let (session_id, people) = session_with(&engine, &["a", "b"]).await;

        let held = engine
            .locks
            .acquire(session_id, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(matches!(
            engine.pick(session_id, &picker(&people[0])).await,
            Err(Error::Busy)
        ));
        assert!(matches!(
            engine.remove_participant(people[1].id).await,
            Err(Error::Busy)
        ));

        drop(held);
        assert!(engine.pick(session_id, &picker(&people[0])).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_last_two_picks() {
        for _ in 0..10 {
            let (_dir, engine) = engine(|s| s.busy_retries = Some(20)).await;
            let (session_id, people) = session_with(&engine, &["a", "b", "c"]).await;

            engine.pick(session_id, &picker(&people[0])).await.unwrap();

            let handles = people[1..].iter().map(|p| {
                let engine = engine.clone();
                let picker = picker(p);
                tokio::spawn(async move { engine.pick(session_id, &picker).await })
            });

            for res in join_all(handles).await {
                res.unwrap().unwrap();
            }
            assert!(graph_of(&engine, session_id).await.is_complete());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_draw_with_removals() {
        let (_dir, engine) = engine(|s| s.busy_retries = Some(50)).await;
        let names: Vec<String> = (0..16).map(|i| format!("p{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let (session_id, people) = session_with(&engine, &names).await;
        let (leaving, staying) = people.split_at(4);

        let picks = staying.iter().map(|p| {
            let engine = engine.clone();
            let picker = picker(p);
            tokio::spawn(async move { engine.pick(session_id, &picker).await.map(|_| ()) })
        });
        let removals = leaving.iter().map(|p| {
            let engine = engine.clone();
            let id = p.id;
            tokio::spawn(async move { engine.remove_participant(id).await })
        });

        let handles: Vec<_> = picks.chain(removals).collect();
        for res in join_all(handles).await {
            res.unwrap().unwrap();
        }

        // Removals may have sent some givers back to the pool.
        let graph = graph_of(&engine, session_id).await;
        for p in leaving {
            assert!(!graph.contains(p.id));
        }
        for p in staying {
            if !graph.has_picked(p.id) {
                engine.pick(session_id, &picker(p)).await.unwrap();
            }
        }
        assert!(graph_of(&engine, session_id).await.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joins_during_picks() {
        let (_dir, engine) = engine(|s| s.busy_retries = Some(50)).await;
        let (session_id, people) = session_with(&engine, &["a", "b", "c", "d", "e", "f"]).await;

        let picks = people.iter().map(|p| {
            let engine = engine.clone();
            let picker = picker(p);
            tokio::spawn(async move { engine.pick(session_id, &picker).await.map(|_| ()) })
        });
        let joins = (0..6).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let name = format!("late{}", i);
                engine
                    .db()
                    .join_session(session_id, &name, &format!("{}@example.com", name))
                    .await
                    .map(|_| ())
            })
        });

        let handles: Vec<_> = picks.chain(joins).collect();
        for res in join_all(handles).await {
            res.unwrap().unwrap();
        }

        let participants = engine.db().list_participants(session_id).await.unwrap();
        assert_eq!(participants.len(), 12);
        let graph = graph_of(&engine, session_id).await;
        assert!(people.iter().all(|p| graph.has_picked(p.id)));

        for p in participants.iter().filter(|p| !p.has_picked) {
            engine.pick(session_id, &picker(p)).await.unwrap();
        }
        assert!(graph_of(&engine, session_id).await.is_complete());
    }
}
