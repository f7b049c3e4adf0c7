//! SQLite database operations
//!
//! All database access goes through this module.
//! Conditional writes carry the idempotency guarantees: membership
//! inserts, guarded counter decrements, CAS job claims and unique-hash
//! enqueues all resolve races at the constraint level, never by
//! read-then-write.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};

use super::models::*;
use crate::error::AppError;
use crate::visibility::VisibilityFilter;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database, creating it if missing, and run
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Config(format!("Failed to create db dir: {}", e)))?;
            }
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Config(format!("Migration failed: {}", e)))?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Actors
    // =========================================================================

    pub async fn upsert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (id, domain, is_local, name, icon, inbox, outbox, url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                domain = excluded.domain,
                name = excluded.name,
                icon = excluded.icon,
                inbox = excluded.inbox,
                outbox = excluded.outbox,
                url = excluded.url,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.domain)
        .bind(actor.is_local)
        .bind(&actor.name)
        .bind(&actor.icon)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.url)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    /// All local actors, the candidate viewer set for fan-out.
    pub async fn get_local_actors(&self) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE is_local = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(actors)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn upsert_object(&self, object: &StoredObject) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO objects (
                id, object_type, actor_id, payload, summary, target,
                to_token, can_reply, can_react, mentions,
                created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                summary = excluded.summary,
                target = excluded.target,
                to_token = excluded.to_token,
                can_reply = excluded.can_reply,
                can_react = excluded.can_react,
                mentions = excluded.mentions,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&object.id)
        .bind(&object.object_type)
        .bind(&object.actor_id)
        .bind(&object.payload)
        .bind(&object.summary)
        .bind(&object.target)
        .bind(&object.to_token)
        .bind(&object.can_reply)
        .bind(&object.can_react)
        .bind(&object.mentions)
        .bind(object.created_at)
        .bind(object.updated_at)
        .bind(object.deleted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_object(&self, id: &str) -> Result<Option<StoredObject>, AppError> {
        let object = sqlx::query_as::<_, StoredObject>("SELECT * FROM objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(object)
    }

    pub async fn soft_delete_object(&self, id: &str) -> Result<u64, AppError> {
        let result =
            sqlx::query("UPDATE objects SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Collection scan through the declarative visibility predicate.
    ///
    /// The filter renders itself into the WHERE clause; this is the same
    /// predicate [`VisibilityFilter::matches`] applies in memory.
    pub async fn list_visible_objects(
        &self,
        filter: &VisibilityFilter,
        limit: i64,
    ) -> Result<Vec<StoredObject>, AppError> {
        let mut builder =
            sqlx::QueryBuilder::<Sqlite>::new("SELECT * FROM objects WHERE deleted_at IS NULL AND ");
        filter.push_sql(&mut builder);
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(limit);

        let objects = builder
            .build_query_as::<StoredObject>()
            .fetch_all(&self.pool)
            .await?;
        Ok(objects)
    }

    // =========================================================================
    // Activity log
    // =========================================================================

    pub async fn insert_activity(&self, record: &ActivityRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO activities (
                id, activity_type, actor_id, object_ref, object_type, target,
                to_token, can_reply, can_react, summary, federate, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.activity_type)
        .bind(&record.actor_id)
        .bind(&record.object_ref)
        .bind(&record.object_type)
        .bind(&record.target)
        .bind(&record.to_token)
        .bind(&record.can_reply)
        .bind(&record.can_react)
        .bind(&record.summary)
        .bind(record.federate)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The only permitted post-dispatch mutation of an activity row.
    pub async fn record_federation_decision(
        &self,
        activity_id: &str,
        federate: bool,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET federate = ? WHERE id = ?")
            .bind(federate)
            .bind(activity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_activity(&self, id: &str) -> Result<Option<ActivityRecord>, AppError> {
        let record = sqlx::query_as::<_, ActivityRecord>("SELECT * FROM activities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Activities a peer domain is allowed to pull, oldest first.
    ///
    /// ULID ids are time-ordered, so the id doubles as the opaque cursor.
    pub async fn list_activities_for_domain(
        &self,
        domain: &str,
        since: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ActivityRecord>, AppError> {
        let domain_token = format!("@{}", domain);
        let since = since.unwrap_or("");
        let records = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT * FROM activities
            WHERE (to_token = '@public' OR to_token = ?) AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(&domain_token)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    // =========================================================================
    // Circles
    // =========================================================================

    pub async fn create_circle(
        &self,
        owner_id: &str,
        kind: CircleKind,
        name: &str,
    ) -> Result<Circle, AppError> {
        let now = Utc::now();
        let circle = Circle {
            id: EntityId::new().0,
            owner_id: owner_id.to_string(),
            kind: kind.as_str().to_string(),
            name: name.to_string(),
            member_count: 0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO circles (id, owner_id, kind, name, member_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&circle.id)
        .bind(&circle.owner_id)
        .bind(&circle.kind)
        .bind(&circle.name)
        .bind(circle.created_at)
        .bind(circle.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(circle)
    }

    pub async fn get_circle(&self, id: &str) -> Result<Option<Circle>, AppError> {
        let circle = sqlx::query_as::<_, Circle>("SELECT * FROM circles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(circle)
    }

    /// Get or create the personal list circle of a kind (blocked, muted,
    /// following) for an owner.
    pub async fn ensure_personal_circle(
        &self,
        owner_id: &str,
        kind: CircleKind,
    ) -> Result<Circle, AppError> {
        let existing = sqlx::query_as::<_, Circle>(
            "SELECT * FROM circles WHERE owner_id = ? AND kind = ? AND name = ?",
        )
        .bind(owner_id)
        .bind(kind.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(circle) = existing {
            return Ok(circle);
        }

        // A concurrent dispatch may create the circle between the select
        // and this insert; the unique constraint resolves the race.
        match self.create_circle(owner_id, kind, kind.as_str()).await {
            Ok(circle) => Ok(circle),
            Err(AppError::Database(sqlx::Error::Database(db_err)))
                if db_err.is_unique_violation() =>
            {
                let circle = sqlx::query_as::<_, Circle>(
                    "SELECT * FROM circles WHERE owner_id = ? AND kind = ? AND name = ?",
                )
                .bind(owner_id)
                .bind(kind.as_str())
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
                Ok(circle)
            }
            Err(e) => Err(e),
        }
    }

    /// Add a member if absent.
    ///
    /// # Returns
    /// `true` if the member was inserted, `false` if already present.
    /// Presence refreshes the denormalized snapshot without touching the
    /// counter, so re-delivery of the same activity is a no-op.
    pub async fn add_member(&self, circle_id: &str, member: &Member) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO circle_members (circle_id, member_id, name, icon, inbox, outbox, url, server, added_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(circle_id, member_id) DO NOTHING
            "#,
        )
        .bind(circle_id)
        .bind(&member.member_id)
        .bind(&member.name)
        .bind(&member.icon)
        .bind(&member.inbox)
        .bind(&member.outbox)
        .bind(&member.url)
        .bind(&member.server)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                "UPDATE circles SET member_count = member_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(Utc::now())
            .bind(circle_id)
            .execute(&mut *tx)
            .await?;
        } else {
            // Refresh-on-write for the snapshot fields.
            sqlx::query(
                r#"
                UPDATE circle_members
                SET name = ?, icon = ?, inbox = ?, outbox = ?, url = ?, server = ?
                WHERE circle_id = ? AND member_id = ?
                "#,
            )
            .bind(&member.name)
            .bind(&member.icon)
            .bind(&member.inbox)
            .bind(&member.outbox)
            .bind(&member.url)
            .bind(&member.server)
            .bind(circle_id)
            .bind(&member.member_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Remove a member if present.
    ///
    /// # Returns
    /// Number of removed rows (0 when absent). The counter decrement is
    /// guarded so it can never go below zero.
    pub async fn remove_member(&self, circle_id: &str, member_id: &str) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM circle_members WHERE circle_id = ? AND member_id = ?",
        )
        .bind(circle_id)
        .bind(member_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed > 0 {
            sqlx::query(
                r#"
                UPDATE circles
                SET member_count = member_count - 1, updated_at = ?
                WHERE id = ? AND member_count > 0
                "#,
            )
            .bind(Utc::now())
            .bind(circle_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    pub async fn is_member(&self, circle_id: &str, member_id: &str) -> Result<bool, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM circle_members WHERE circle_id = ? AND member_id = ?",
        )
        .bind(circle_id)
        .bind(member_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn members_of(&self, circle_id: &str) -> Result<Vec<Member>, AppError> {
        let members = sqlx::query_as::<_, Member>(
            r#"
            SELECT member_id, name, icon, inbox, outbox, url, server
            FROM circle_members WHERE circle_id = ?
            ORDER BY member_id
            "#,
        )
        .bind(circle_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    /// Ids of every circle/group the actor belongs to.
    pub async fn circle_ids_for_member(
        &self,
        member_id: &str,
    ) -> Result<HashSet<String>, AppError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT circle_id FROM circle_members WHERE member_id = ?")
                .bind(member_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    /// Member ids in the owner's following list (actor ids and
    /// `@domain` tokens).
    pub async fn following_member_ids(
        &self,
        owner_id: &str,
    ) -> Result<HashSet<String>, AppError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT m.member_id FROM circle_members m
            JOIN circles c ON c.id = m.circle_id
            WHERE c.owner_id = ? AND c.kind = 'following'
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Actor ids in the viewer's blocked list.
    pub async fn blocked_actor_ids(&self, owner_id: &str) -> Result<HashSet<String>, AppError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT m.member_id FROM circle_members m
            JOIN circles c ON c.id = m.circle_id
            WHERE c.owner_id = ? AND c.kind = 'blocked'
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Assemble the ephemeral per-request viewer context.
    pub async fn viewer_context(
        &self,
        viewer_id: &str,
        viewer_domain: &str,
    ) -> Result<ViewerContext, AppError> {
        let circle_ids = self.circle_ids_for_member(viewer_id).await?;
        let blocked_actor_ids = self.blocked_actor_ids(viewer_id).await?;
        Ok(ViewerContext {
            viewer_id: Some(viewer_id.to_string()),
            viewer_domain: viewer_domain.to_string(),
            circle_ids,
            blocked_actor_ids,
        })
    }

    /// Local viewers whose following list contains any of the given
    /// member ids (remote actor ids or an `@domain` token).
    pub async fn local_followers_of(
        &self,
        member_ids: &[String],
    ) -> Result<Vec<String>, AppError> {
        if member_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            r#"
            SELECT DISTINCT c.owner_id FROM circles c
            JOIN circle_members m ON m.circle_id = c.id
            JOIN actors a ON a.id = c.owner_id
            WHERE c.kind = 'following' AND a.is_local = 1 AND m.member_id IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for id in member_ids {
            separated.push_bind(id);
        }
        builder.push(")");

        let viewers = builder
            .build_query_scalar::<String>()
            .fetch_all(&self.pool)
            .await?;
        Ok(viewers)
    }

    // =========================================================================
    // Timeline entries
    // =========================================================================

    /// Idempotent upsert keyed by (viewer_id, object_id).
    ///
    /// Re-running fan-out for the same object refreshes the row in place;
    /// the unique constraint is the correctness backstop.
    pub async fn upsert_timeline_entry(&self, entry: &TimelineEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO timeline_entries (
                id, viewer_id, object_id, object_type, created_at,
                reason, scope, local_circle_id, snapshot, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(viewer_id, object_id) DO UPDATE SET
                object_type = excluded.object_type,
                created_at = excluded.created_at,
                reason = excluded.reason,
                scope = excluded.scope,
                local_circle_id = excluded.local_circle_id,
                snapshot = excluded.snapshot,
                deleted_at = NULL
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.viewer_id)
        .bind(&entry.object_id)
        .bind(&entry.object_type)
        .bind(entry.created_at)
        .bind(&entry.reason)
        .bind(&entry.scope)
        .bind(&entry.local_circle_id)
        .bind(&entry.snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A viewer's timeline, sorted by the source object's timestamp.
    pub async fn home_timeline(
        &self,
        viewer_id: &str,
        limit: i64,
    ) -> Result<Vec<TimelineEntry>, AppError> {
        let entries = sqlx::query_as::<_, TimelineEntry>(
            r#"
            SELECT * FROM timeline_entries
            WHERE viewer_id = ? AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(viewer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn get_timeline_entry(
        &self,
        viewer_id: &str,
        object_id: &str,
    ) -> Result<Option<TimelineEntry>, AppError> {
        let entry = sqlx::query_as::<_, TimelineEntry>(
            "SELECT * FROM timeline_entries WHERE viewer_id = ? AND object_id = ?",
        )
        .bind(viewer_id)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn soft_delete_timeline_entries(&self, object_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE timeline_entries SET deleted_at = ? WHERE object_id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Hard-delete entries soft-deleted before the cutoff.
    pub async fn sweep_timeline_retention(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM timeline_entries WHERE deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Delivery jobs
    // =========================================================================

    /// Enqueue a delivery job.
    ///
    /// # Returns
    /// The job id, or `None` when an identical logical delivery (same
    /// dedupe hash) is already queued; the unique-constraint violation
    /// is swallowed as "already queued".
    pub async fn enqueue_delivery_job(
        &self,
        job: &DeliveryJob,
    ) -> Result<Option<String>, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                id, object_id, status, audience, domains, counts,
                attempts, max_attempts, next_attempt_at, last_error,
                dedupe_hash, expires_at, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedupe_hash) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.object_id)
        .bind(&job.status)
        .bind(&job.audience)
        .bind(&job.domains)
        .bind(&job.counts)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.next_attempt_at)
        .bind(&job.last_error)
        .bind(&job.dedupe_hash)
        .bind(job.expires_at)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        Ok(inserted.then(|| job.id.clone()))
    }

    /// Claim due pending jobs for processing.
    ///
    /// Each claim is a compare-and-set `pending -> processing`; a row
    /// another worker claimed in between simply fails the CAS and is
    /// skipped. This is the only double-delivery defense and it must
    /// stay atomic.
    pub async fn claim_due_delivery_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let candidate_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_jobs
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let won = sqlx::query(
                "UPDATE delivery_jobs SET status = 'processing' WHERE id = ? AND status = 'pending'",
            )
            .bind(&id)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if !won {
                continue;
            }

            if let Some(job) =
                sqlx::query_as::<_, DeliveryJob>("SELECT * FROM delivery_jobs WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&self.pool)
                    .await?
            {
                claimed.push(job);
            }
        }

        Ok(claimed)
    }

    pub async fn complete_delivery_job(
        &self,
        id: &str,
        counts: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'completed', counts = ?, completed_at = ?, last_error = NULL, domains = '[]'
            WHERE id = ?
            "#,
        )
        .bind(counts)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retain the job for the failed subset only and schedule the retry.
    pub async fn reschedule_delivery_job(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
        remaining_domains: &str,
        counts: &str,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'pending', attempts = ?, next_attempt_at = ?,
                domains = ?, counts = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(remaining_domains)
        .bind(counts)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure: attempts exhausted, surfaced for operators,
    /// never retried.
    pub async fn fail_delivery_job(
        &self,
        id: &str,
        attempts: i64,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_jobs SET status = 'failed', attempts = ?, last_error = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_delivery_job(&self, id: &str) -> Result<Option<DeliveryJob>, AppError> {
        let job = sqlx::query_as::<_, DeliveryJob>("SELECT * FROM delivery_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Recent jobs for operator visibility, newest first.
    pub async fn list_delivery_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, DeliveryJob>(
                    "SELECT * FROM delivery_jobs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeliveryJob>(
                    "SELECT * FROM delivery_jobs ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    pub async fn count_delivery_jobs(&self, status: JobStatus) -> Result<i64, AppError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// TTL purge, independent of job status.
    pub async fn sweep_expired_delivery_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM delivery_jobs WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Fan-out jobs
    // =========================================================================

    pub async fn enqueue_fanout_job(
        &self,
        object_id: &str,
        max_attempts: i64,
    ) -> Result<String, AppError> {
        let id = EntityId::new().0;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO fanout_jobs (id, object_id, status, attempts, max_attempts, next_attempt_at, created_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(object_id)
        .bind(max_attempts)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Same CAS claim discipline as delivery jobs.
    pub async fn claim_due_fanout_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<FanoutJob>, AppError> {
        let candidate_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM fanout_jobs
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let won = sqlx::query(
                "UPDATE fanout_jobs SET status = 'processing' WHERE id = ? AND status = 'pending'",
            )
            .bind(&id)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if !won {
                continue;
            }

            if let Some(job) =
                sqlx::query_as::<_, FanoutJob>("SELECT * FROM fanout_jobs WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&self.pool)
                    .await?
            {
                claimed.push(job);
            }
        }

        Ok(claimed)
    }

    pub async fn complete_fanout_job(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM fanout_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reschedule_fanout_job(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE fanout_jobs
            SET status = 'pending', attempts = ?, next_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_fanout_job(
        &self,
        id: &str,
        attempts: i64,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE fanout_jobs SET status = 'failed', attempts = ?, last_error = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Federation cursors
    // =========================================================================

    pub async fn get_cursor(
        &self,
        viewer_id: &str,
        circle_id: &str,
        remote_domain: &str,
    ) -> Result<Option<FederationCursor>, AppError> {
        let cursor = sqlx::query_as::<_, FederationCursor>(
            r#"
            SELECT * FROM federation_cursors
            WHERE viewer_id = ? AND circle_id = ? AND remote_domain = ?
            "#,
        )
        .bind(viewer_id)
        .bind(circle_id)
        .bind(remote_domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cursor)
    }

    /// Advance (or create) the cursor; only called after a successful
    /// pull.
    pub async fn upsert_cursor(
        &self,
        viewer_id: &str,
        circle_id: &str,
        remote_domain: &str,
        since: &str,
        state_hash: &str,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO federation_cursors (
                id, viewer_id, circle_id, remote_domain, since, state_hash, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(viewer_id, circle_id, remote_domain) DO UPDATE SET
                since = excluded.since,
                state_hash = excluded.state_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(EntityId::new().0)
        .bind(viewer_id)
        .bind(circle_id)
        .bind(remote_domain)
        .bind(since)
        .bind(state_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop the cursor on unfollow/circle removal.
    pub async fn delete_cursor(
        &self,
        viewer_id: &str,
        circle_id: &str,
        remote_domain: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM federation_cursors WHERE viewer_id = ? AND circle_id = ? AND remote_domain = ?",
        )
        .bind(viewer_id)
        .bind(circle_id)
        .bind(remote_domain)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Signature nonces
    // =========================================================================

    /// Record a verified signature hash.
    ///
    /// # Returns
    /// `true` if recorded, `false` when the hash is already live; the
    /// caller rejects the request as a replay. Expired rows are reclaimed
    /// in place.
    pub async fn record_nonce(
        &self,
        signature_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let now = Utc::now();

        // Reclaim the slot when the previous use of this hash has expired.
        sqlx::query("DELETE FROM signature_nonces WHERE signature_hash = ? AND expires_at < ?")
            .bind(signature_hash)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO signature_nonces (signature_hash, expires_at, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(signature_hash) DO NOTHING
            "#,
        )
        .bind(signature_hash)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        Ok(inserted)
    }

    pub async fn sweep_expired_nonces(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM signature_nonces WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
