//! Policy-enforced store gateway.
//!
//! The only way to obtain a store connection. `acquire` installs the session
//! context on the checked-out connection and reads it back; dropping the
//! returned handle rolls back any open transaction and clears the context
//! before the connection goes back to the pool.

use diesel::r2d2::PooledConnection;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::config::{DatabaseConfig, StoreBackend};
use crate::core::error::GovernanceError;
use crate::core::events::DomainEvent;
use crate::core::session::{
    ContextReadback, ContextSnapshot, SessionContext, PARAM_CURRENT_ORG, PARAM_CURRENT_ROLE,
    PARAM_CURRENT_USER, SESSION_PARAMETERS,
};
use crate::core::shared::models::TableRlsStatus;
use crate::core::shared::schema::TENANT_TABLES;
use crate::core::store::{
    build_pool, postgres, DbPool, MemoryDatabase, StoreConnection, StoreError, StoreManager,
};

/// Runs store work on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, GovernanceError>
where
    F: FnOnce() -> Result<T, GovernanceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GovernanceError::Store(StoreError::Connection(format!("blocking task failed: {e}"))))?
}

#[derive(Clone)]
pub struct TenantGateway {
    pool: DbPool,
    checkout_timeout: Duration,
}

impl std::fmt::Debug for TenantGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantGateway")
            .field("state", &self.pool.state())
            .field("checkout_timeout", &self.checkout_timeout)
            .finish()
    }
}

impl TenantGateway {
    pub fn new(pool: DbPool, checkout_timeout: Duration) -> Self {
        Self {
            pool,
            checkout_timeout,
        }
    }

    pub fn in_memory(
        db: &MemoryDatabase,
        pool_size: u32,
        checkout_timeout: Duration,
    ) -> Result<Self, GovernanceError> {
        let pool = build_pool(StoreManager::memory(db.clone()), pool_size, checkout_timeout)?;
        Ok(Self::new(pool, checkout_timeout))
    }

    /// Builds the pool for the configured backend, applying migrations first
    /// when asked to.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, GovernanceError> {
        let timeout = config.checkout_timeout();
        match config.backend {
            StoreBackend::Postgres => {
                if config.run_migrations {
                    postgres::run_migrations(&config.url)?;
                }
                let pool = build_pool(StoreManager::postgres(&config.url), config.pool_size, timeout)?;
                Ok(Self::new(pool, timeout))
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; data is lost on exit");
                Self::in_memory(&MemoryDatabase::new(), config.pool_size, timeout)
            }
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn checkout(&self) -> Result<PooledConnection<StoreManager>, GovernanceError> {
        self.pool.get_timeout(self.checkout_timeout).map_err(|e| {
            let state = self.pool.state();
            warn!(
                connections = state.connections,
                idle = state.idle_connections,
                "Connection checkout timed out: {}",
                e
            );
            GovernanceError::PoolExhausted(e.to_string())
        })
    }

    /// Checks out a connection and binds `ctx` to it. Without a context the
    /// connection sees no tenant rows and refuses every write.
    pub fn acquire(&self, ctx: Option<&SessionContext>) -> Result<TenantConnection, GovernanceError> {
        let mut conn = TenantConnection {
            conn: self.checkout()?,
            context: None,
        };
        if let Some(ctx) = ctx {
            conn.enter_context(ctx)?;
        }
        Ok(conn)
    }

    /// Starts a unit of work: a bound connection with an open transaction.
    pub fn enter(&self, ctx: &SessionContext) -> Result<UnitOfWork, GovernanceError> {
        let mut conn = self.acquire(Some(ctx))?;
        conn.begin()?;
        Ok(UnitOfWork {
            conn,
            context: ctx.clone(),
            outbox: Vec::new(),
            on_finish: Vec::new(),
        })
    }

    /// Starts a unit of work from a snapshot handed to background work.
    pub fn enter_snapshot(&self, snapshot: &ContextSnapshot) -> Result<UnitOfWork, GovernanceError> {
        self.enter(snapshot.context())
    }

    pub fn rls_status(&self) -> Result<Vec<TableRlsStatus>, GovernanceError> {
        let mut conn = self.acquire(None)?;
        Ok(conn.read().rls_status(&TENANT_TABLES)?)
    }

    /// Fails with `RlsDisabled` when any tenant table lacks an active,
    /// forced row filter. The server refuses to start in that case.
    pub fn verify_row_security(&self) -> Result<Vec<TableRlsStatus>, GovernanceError> {
        let status = self.rls_status()?;
        let unprotected: Vec<String> = status
            .iter()
            .filter(|s| !s.is_protected())
            .map(|s| s.table.clone())
            .collect();

        if !unprotected.is_empty() {
            error!(tables = ?unprotected, "Tenant tables without row-level security");
            return Err(GovernanceError::RlsDisabled(unprotected));
        }
        info!(tables = status.len(), "Row-level security active on every tenant table");
        Ok(status)
    }
}

/// A pooled connection carrying at most one session context.
pub struct TenantConnection {
    conn: PooledConnection<StoreManager>,
    context: Option<SessionContext>,
}

impl TenantConnection {
    pub fn session(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    /// Installs `ctx` as the connection's runtime parameters.
    pub fn enter_context(&mut self, ctx: &SessionContext) -> Result<(), GovernanceError> {
        if self.context.is_some() {
            return Err(GovernanceError::ContextAlreadyEntered);
        }
        if self.validate_context()?.is_set {
            // A previous holder left its context behind.
            self.conn.mark_broken();
            return Err(GovernanceError::ContextAlreadyEntered);
        }

        for (name, value) in ctx.parameters() {
            if let Err(e) = self.conn.set_parameter(name, Some(&value)) {
                error!(param = name, "Failed to bind session context: {}", e);
                self.discard_context();
                return Err(e.into());
            }
        }

        let readback = self.validate_context()?;
        if !readback.matches(ctx) {
            error!(org_id = %ctx.organization_id, "Session context readback mismatch");
            self.discard_context();
            return Err(GovernanceError::ContextMissing);
        }

        debug!(
            org_id = %ctx.organization_id,
            user_id = %ctx.user_id,
            role = %ctx.role,
            "Session context bound"
        );
        self.context = Some(ctx.clone());
        Ok(())
    }

    /// Clears the runtime parameters. The connection stays checked out.
    pub fn exit_context(&mut self) -> Result<(), GovernanceError> {
        self.context = None;
        clear_parameters(&mut **self.conn)?;
        Ok(())
    }

    pub fn validate_context(&mut self) -> Result<ContextReadback, GovernanceError> {
        let org = self.conn.parameter(PARAM_CURRENT_ORG)?;
        let user = self.conn.parameter(PARAM_CURRENT_USER)?;
        let role = self.conn.parameter(PARAM_CURRENT_ROLE)?;
        Ok(ContextReadback::from_raw(
            org.as_deref(),
            user.as_deref(),
            role.as_deref(),
        ))
    }

    /// Tenant-scoped reads. Without context the row filter yields no rows.
    pub fn read(&mut self) -> &mut dyn StoreConnection {
        &mut **self.conn
    }

    /// Mutations. Refused outright when no context is bound.
    pub fn write(&mut self) -> Result<&mut dyn StoreConnection, GovernanceError> {
        let readback = self.validate_context()?;
        let bound = match &self.context {
            Some(ctx) => readback.matches(ctx),
            None => false,
        };
        if !bound {
            error!(is_set = readback.is_set, "Mutating query without session context");
            return Err(GovernanceError::ContextMissing);
        }
        Ok(&mut **self.conn)
    }

    pub fn begin(&mut self) -> Result<(), GovernanceError> {
        Ok(self.conn.begin()?)
    }

    pub fn commit(&mut self) -> Result<(), GovernanceError> {
        Ok(self.conn.commit()?)
    }

    pub fn rollback(&mut self) -> Result<(), GovernanceError> {
        Ok(self.conn.rollback()?)
    }

    fn discard_context(&mut self) {
        if clear_parameters(&mut **self.conn).is_err() {
            self.conn.mark_broken();
        }
    }
}

fn clear_parameters(conn: &mut dyn StoreConnection) -> Result<(), StoreError> {
    for name in SESSION_PARAMETERS {
        conn.set_parameter(name, None)?;
    }
    Ok(())
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        if self.conn.in_transaction() {
            if let Err(e) = self.conn.rollback() {
                warn!("Rollback on release failed: {}", e);
                self.conn.mark_broken();
            }
        }
        if let Err(e) = clear_parameters(&mut **self.conn) {
            warn!("Clearing session context failed, discarding connection: {}", e);
            self.conn.mark_broken();
        }
        self.context = None;
    }
}

/// Runs once the unit of work ends; the flag tells whether it committed.
pub type FinishHook = Box<dyn FnOnce(bool) + Send>;

/// One transaction on one bound connection, plus the events it will publish
/// once committed. Dropping it without `commit` rolls everything back.
pub struct UnitOfWork {
    conn: TenantConnection,
    context: SessionContext,
    outbox: Vec<DomainEvent>,
    on_finish: Vec<FinishHook>,
}

impl UnitOfWork {
    pub fn session(&self) -> &SessionContext {
        &self.context
    }

    pub fn read(&mut self) -> &mut dyn StoreConnection {
        self.conn.read()
    }

    pub fn write(&mut self) -> Result<&mut dyn StoreConnection, GovernanceError> {
        self.conn.write()
    }

    pub fn validate_context(&mut self) -> Result<ContextReadback, GovernanceError> {
        self.conn.validate_context()
    }

    pub fn enqueue(&mut self, event: DomainEvent) {
        self.outbox.push(event);
    }

    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.outbox
    }

    /// Registers `hook` to run after the transaction ends, with `true` only
    /// when it committed.
    pub fn on_finish(&mut self, hook: impl FnOnce(bool) + Send + 'static) {
        self.on_finish.push(Box::new(hook));
    }

    /// Commits and returns the events to publish. On failure nothing was
    /// written and the events are dropped.
    pub fn commit(mut self) -> Result<Vec<DomainEvent>, GovernanceError> {
        self.conn.commit()?;
        self.finish(true);
        Ok(std::mem::take(&mut self.outbox))
    }

    pub fn rollback(mut self) -> Result<(), GovernanceError> {
        self.outbox.clear();
        let result = self.conn.rollback();
        self.finish(false);
        result
    }

    fn finish(&mut self, committed: bool) {
        for hook in self.on_finish.drain(..) {
            hook(committed);
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.on_finish.is_empty() {
            return;
        }
        // The connection's own drop rolls back after this; hooks must not
        // observe the transaction as still open.
        if self.conn.conn.in_transaction() {
            if let Err(e) = self.conn.conn.rollback() {
                warn!("Rollback on drop failed: {}", e);
                self.conn.conn.mark_broken();
            }
        }
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Role;
    use crate::core::shared::models::Ticket;
    use chrono::Utc;
    use uuid::Uuid;

    fn gateway(db: &MemoryDatabase, size: u32) -> TenantGateway {
        TenantGateway::in_memory(db, size, Duration::from_millis(100)).expect("gateway")
    }

    fn ticket(org: Uuid) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            organization_id: org,
            subject: "Printer on fire".into(),
            description: None,
            status: "open".into(),
            priority: "high".into(),
            requester_id: None,
            assignee_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_acquire_binds_context() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 2);
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);

        let mut conn = gw.acquire(Some(&ctx)).expect("acquire");
        let readback = conn.validate_context().expect("readback");
        assert!(readback.is_set);
        assert!(readback.matches(&ctx));
    }

    #[test]
    fn test_write_without_context_is_refused() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let mut conn = gw.acquire(None).expect("acquire");

        assert!(conn.read().tickets().expect("list").is_empty());
        assert!(matches!(conn.write(), Err(GovernanceError::ContextMissing)));
    }

    #[test]
    fn test_second_enter_is_rejected() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let mut conn = gw.acquire(Some(&ctx)).expect("acquire");

        assert!(matches!(
            conn.enter_context(&ctx),
            Err(GovernanceError::ContextAlreadyEntered)
        ));

        conn.exit_context().expect("exit");
        conn.enter_context(&ctx).expect("enter after exit");
    }

    #[test]
    fn test_release_clears_context() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Manager);

        drop(gw.acquire(Some(&ctx)).expect("acquire"));

        let mut reused = gw.acquire(None).expect("reacquire");
        assert!(!reused.validate_context().expect("readback").is_set);
    }

    #[test]
    fn test_checkout_timeout_is_pool_exhausted() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let _held = gw.acquire(None).expect("first");
        assert!(matches!(
            gw.acquire(None),
            Err(GovernanceError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_dropped_unit_of_work_rolls_back() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let org = Uuid::new_v4();
        let ctx = SessionContext::new(org, Uuid::new_v4(), Role::Agent);

        {
            let mut uow = gw.enter(&ctx).expect("enter");
            uow.write()
                .expect("bound")
                .insert_ticket(&ticket(org))
                .expect("insert");
        }
        assert_eq!(db.row_count("tickets"), 0);

        let mut uow = gw.enter(&ctx).expect("enter");
        uow.write()
            .expect("bound")
            .insert_ticket(&ticket(org))
            .expect("insert");
        uow.commit().expect("commit");
        assert_eq!(db.row_count("tickets"), 1);
    }

    #[test]
    fn test_finish_hooks_see_outcome() {
        use std::sync::{Arc, Mutex};

        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook = |seen: &Arc<Mutex<Vec<bool>>>| {
            let seen = Arc::clone(seen);
            move |committed: bool| seen.lock().expect("lock").push(committed)
        };

        let mut uow = gw.enter(&ctx).expect("enter");
        uow.on_finish(hook(&seen));
        uow.commit().expect("commit");

        let mut uow = gw.enter(&ctx).expect("enter");
        uow.on_finish(hook(&seen));
        drop(uow);

        let mut uow = gw.enter(&ctx).expect("enter");
        uow.on_finish(hook(&seen));
        db.fail_next_commit();
        assert!(uow.commit().is_err());

        assert_eq!(*seen.lock().expect("lock"), vec![true, false, false]);
    }

    #[test]
    fn test_verify_row_security() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db, 1);
        assert_eq!(
            gw.verify_row_security().expect("all protected").len(),
            TENANT_TABLES.len()
        );

        db.disable_row_security("ai_provenance");
        match gw.verify_row_security() {
            Err(GovernanceError::RlsDisabled(tables)) => {
                assert_eq!(tables, vec!["ai_provenance".to_string()])
            }
            other => panic!("expected RlsDisabled, got {other:?}"),
        }
    }
}
