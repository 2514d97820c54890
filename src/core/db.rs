use rand::{distributions::Alphanumeric, Rng};
use sqlx::{
    error::ErrorKind,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    types::time,
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};

use crate::{
    core::{
        participant::{Participant, ParticipantRef, Recipient},
        session::Session,
        settings::Settings,
    },
    error::{map_edge_write, map_participant_insert, Error, Result},
};

const SCHEMA: [&str; 4] = [
    "create table if not exists sessions(
        id integer primary key autoincrement,
        name text not null,
        invite_code text not null unique,
        is_active boolean not null default 1,
        created_at datetime not null
    );",
    "create table if not exists participants(
        id integer primary key autoincrement,
        session_id integer not null,
        name text not null,
        email text not null collate nocase,
        has_picked boolean not null default 0,
        assigned_to integer,
        created_at datetime not null,
        unique(session_id, email),
        check(assigned_to is null or assigned_to <> id),
        check(has_picked = (assigned_to is not null)),
        foreign key(session_id) references sessions(id) on delete cascade,
        foreign key(assigned_to) references participants(id)
    );",
    // A participant has at most one giver.
    "create unique index if not exists participants_assigned_to
        on participants(assigned_to) where assigned_to is not null;",
    "create index if not exists participants_session on participants(session_id);",
];

/// SQLite-backed store for sessions and participants.
pub struct DrawDb {
    db: SqlitePool,
}

impl DrawDb {
    async fn connect(settings: &Settings) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(&settings.database)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(settings.sqlite_busy_timeout());

        Ok(SqlitePoolOptions::new()
            .max_connections(settings.max_connections())
            .acquire_timeout(settings.lock_timeout())
            .connect_with(options)
            .await?)
    }

    /// Open the database, creating it and its tables if needed.
    pub async fn init(settings: &Settings) -> Result<Self> {
        let db = Self::connect(settings).await?;

        let mut tx = db.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        log::debug!("Initialized database {}", settings.database.display());
        Ok(DrawDb { db })
    }

    /// Open an existing database without touching its schema.
    pub async fn load(settings: &Settings) -> Result<Self> {
        Ok(DrawDb {
            db: Self::connect(settings).await?,
        })
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.db.begin().await?)
    }

    pub async fn create_session(&self, name: &str, invite_code_length: usize) -> Result<Session> {
        log::debug!("Creating session {}", name);

        // Invite codes are random, retry the rare collision.
        let mut attempts = 0;
        loop {
            let invite_code: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(invite_code_length)
                .map(char::from)
                .collect::<String>()
                .to_uppercase();

            // Run `returning` statements to completion, a half-read one keeps the insert uncommitted.
            let res: std::result::Result<Vec<Session>, sqlx::Error> = sqlx::query_as(
                "insert into sessions(name, invite_code, is_active, created_at)
                    values(?, ?, 1, ?)
                    returning *",
            )
            .bind(name)
            .bind(&invite_code)
            .bind(time::OffsetDateTime::now_utc())
            .fetch_all(&self.db)
            .await;

            match res {
                Err(sqlx::Error::Database(e))
                    if matches!(e.kind(), ErrorKind::UniqueViolation) && attempts < 5 =>
                {
                    attempts += 1;
                    log::debug!("Invite code {} already in use, regenerating", invite_code);
                }
                res => return res?.pop().ok_or_else(|| sqlx::Error::RowNotFound.into()),
            }
        }
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        fetch_session(&mut *self.db.acquire().await?, session_id).await
    }

    pub async fn find_session_by_invite_code(&self, invite_code: &str) -> Result<Option<Session>> {
        Ok(
            sqlx::query_as("select * from sessions where invite_code = ? limit 1")
                .bind(invite_code.trim().to_uppercase())
                .fetch_optional(&self.db)
                .await?,
        )
    }

    pub async fn set_session_active(&self, session_id: i64, active: bool) -> Result<()> {
        let res = sqlx::query("update sessions set is_active = ? where id = ?")
            .bind(active)
            .bind(session_id)
            .execute(&self.db)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::SessionNotFound(session_id));
        }
        Ok(())
    }

    /// Register someone in an active session, or return their existing row.
    pub async fn join_session(&self, session_id: i64, name: &str, email: &str) -> Result<Participant> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or(Error::SessionNotFound(session_id))?;
        if !session.is_active {
            return Err(Error::SessionNotActive(session_id));
        }

        if let Some(existing) = self.find_participant_by_email(session_id, email).await? {
            return Ok(existing);
        }

        match self.create_participant(session_id, name, email).await {
            // Somebody registered the same email in the meantime.
            Err(Error::DuplicateEmail(_)) => self
                .find_participant_by_email(session_id, email)
                .await?
                .ok_or_else(|| Error::ParticipantNotFound(email.to_owned())),
            res => res,
        }
    }

    pub async fn list_participants(&self, session_id: i64) -> Result<Vec<Participant>> {
        fetch_session_participants(&mut *self.db.acquire().await?, session_id).await
    }

    /// Participants nobody has drawn yet.
    pub async fn list_available_recipients(&self, session_id: i64) -> Result<Vec<Participant>> {
        Ok(sqlx::query_as(
            "select * from participants p
                where p.session_id = ?
                and not exists (select 1 from participants g where g.assigned_to = p.id)
                order by p.id",
        )
        .bind(session_id)
        .fetch_all(&self.db)
        .await?)
    }

    pub async fn get_participant(&self, participant_id: i64) -> Result<Option<Participant>> {
        fetch_participant(&mut *self.db.acquire().await?, participant_id).await
    }

    pub async fn find_participant_by_email(
        &self,
        session_id: i64,
        email: &str,
    ) -> Result<Option<Participant>> {
        fetch_participant_by_email(&mut *self.db.acquire().await?, session_id, email).await
    }

    pub async fn create_participant(
        &self,
        session_id: i64,
        name: &str,
        email: &str,
    ) -> Result<Participant> {
        insert_participant(&mut *self.db.acquire().await?, session_id, name, email).await
    }

    /// Public identity of whoever `participant` gives to, read in a single statement.
    pub async fn get_assignment(
        &self,
        session_id: i64,
        participant: &ParticipantRef,
    ) -> Result<Option<Recipient>> {
        let query = match participant {
            ParticipantRef::Id(id) => sqlx::query_as::<Sqlite, Recipient>(
                "select r.name, r.email from participants p
                    inner join participants r on p.assigned_to = r.id
                    where p.session_id = ? and p.id = ?
                    limit 1",
            )
            .bind(session_id)
            .bind(*id),
            ParticipantRef::Email(email) => sqlx::query_as::<Sqlite, Recipient>(
                "select r.name, r.email from participants p
                    inner join participants r on p.assigned_to = r.id
                    where p.session_id = ? and p.email = ?
                    limit 1",
            )
            .bind(session_id)
            .bind(email.trim().to_owned()),
        };

        Ok(query.fetch_optional(&self.db).await?)
    }
}

pub async fn fetch_session(conn: &mut SqliteConnection, session_id: i64) -> Result<Option<Session>> {
    Ok(sqlx::query_as("select * from sessions where id = ? limit 1")
        .bind(session_id)
        .fetch_optional(conn)
        .await?)
}

pub async fn fetch_participant(
    conn: &mut SqliteConnection,
    participant_id: i64,
) -> Result<Option<Participant>> {
    Ok(sqlx::query_as("select * from participants where id = ? limit 1")
        .bind(participant_id)
        .fetch_optional(conn)
        .await?)
}

pub async fn fetch_participant_by_email(
    conn: &mut SqliteConnection,
    session_id: i64,
    email: &str,
) -> Result<Option<Participant>> {
    Ok(
        sqlx::query_as("select * from participants where session_id = ? and email = ? limit 1")
            .bind(session_id)
            .bind(email.trim())
            .fetch_optional(conn)
            .await?,
    )
}

pub async fn fetch_session_participants(
    conn: &mut SqliteConnection,
    session_id: i64,
) -> Result<Vec<Participant>> {
    Ok(
        sqlx::query_as("select * from participants where session_id = ? order by id")
            .bind(session_id)
            .fetch_all(conn)
            .await?,
    )
}

pub async fn insert_participant(
    conn: &mut SqliteConnection,
    session_id: i64,
    name: &str,
    email: &str,
) -> Result<Participant> {
    log::debug!("Adding {} to session {}", email, session_id);
    let email = email.trim();
    let mut rows: Vec<Participant> = sqlx::query_as(
        "insert into participants(session_id, name, email, has_picked, created_at)
            values(?, ?, ?, 0, ?)
            returning *",
    )
    .bind(session_id)
    .bind(name.trim())
    .bind(email)
    .bind(time::OffsetDateTime::now_utc())
    .fetch_all(conn)
    .await
    .map_err(|e| map_participant_insert(e, email))?;

    rows.pop().ok_or_else(|| sqlx::Error::RowNotFound.into())
}

/// Write a participant's outgoing edge. `has_picked` follows the edge.
pub async fn update_participant_edges(
    conn: &mut SqliteConnection,
    participant_id: i64,
    assigned_to: Option<i64>,
) -> Result<()> {
    if assigned_to == Some(participant_id) {
        log::error!("Refusing to store participant {} giving to themselves", participant_id);
        return Err(Error::CannotSelfAssign);
    }

    let res = sqlx::query("update participants set assigned_to = ?, has_picked = ? where id = ?")
        .bind(assigned_to)
        .bind(assigned_to.is_some())
        .bind(participant_id)
        .execute(conn)
        .await
        .map_err(map_edge_write)?;

    if res.rows_affected() == 0 {
        return Err(Error::ParticipantNotFound(format!("#{}", participant_id)));
    }
    Ok(())
}

pub async fn delete_participant_row(conn: &mut SqliteConnection, participant_id: i64) -> Result<()> {
    sqlx::query("delete from participants where id = ?")
        .bind(participant_id)
        .execute(conn)
        .await
        .map_err(map_edge_write)?;
    Ok(())
}
