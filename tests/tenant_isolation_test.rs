#[cfg(test)]
mod tenant_isolation_integration_tests {
    use helpdesk_core::core::config::PolicyConfig;
    use helpdesk_core::core::store::MemoryDatabase;
    use helpdesk_core::security::audit::AuditRecorder;
    use helpdesk_core::security::policy::PolicyEngine;
    use helpdesk_core::tickets::{
        create_ticket, list_tickets, update_ticket, CreateTicketRequest, UpdateTicketRequest,
        ENTITY_TICKET,
    };
    use helpdesk_core::{GovernanceError, Role, SessionContext, TenantGateway};
    use std::collections::HashSet;
    use std::time::Duration;
    use uuid::Uuid;

    struct Desk {
        db: MemoryDatabase,
        gateway: TenantGateway,
        policy: PolicyEngine,
        audit: AuditRecorder,
    }

    fn desk() -> Desk {
        let db = MemoryDatabase::new();
        let gateway = TenantGateway::in_memory(&db, 4, Duration::from_millis(200))
            .expect("gateway");
        Desk {
            db,
            gateway,
            policy: PolicyEngine::new(&PolicyConfig::default()),
            audit: AuditRecorder::new(),
        }
    }

    fn seed(desk: &Desk, ctx: &SessionContext, count: usize) -> Vec<Uuid> {
        let mut uow = desk.gateway.enter(ctx).expect("enter");
        let ids = (0..count)
            .map(|n| {
                create_ticket(
                    &mut uow,
                    &desk.policy,
                    &desk.audit,
                    CreateTicketRequest {
                        subject: format!("Ticket {n}"),
                        description: None,
                        priority: None,
                        requester_id: None,
                        assignee_id: None,
                    },
                )
                .expect("create")
                .id
            })
            .collect();
        desk.audit.commit(uow).expect("commit");
        ids
    }

    #[test]
    fn test_cross_tenant_isolation() {
        let desk = desk();
        let org_a = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let org_b = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let a_ids: HashSet<Uuid> = seed(&desk, &org_a, 3).into_iter().collect();
        let b_ids: HashSet<Uuid> = seed(&desk, &org_b, 3).into_iter().collect();

        let seen_a: HashSet<Uuid> = list_tickets(&desk.gateway, Some(&org_a))
            .expect("list A")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(seen_a, a_ids);

        let seen_b: HashSet<Uuid> = list_tickets(&desk.gateway, Some(&org_b))
            .expect("list B")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(seen_b, b_ids);

        assert!(list_tickets(&desk.gateway, None).expect("list").is_empty());

        let mut conn = desk.gateway.acquire(None).expect("acquire");
        assert!(matches!(conn.write(), Err(GovernanceError::ContextMissing)));
    }

    #[test]
    fn test_released_connection_carries_no_context() {
        let db = MemoryDatabase::new();
        let gateway = TenantGateway::in_memory(&db, 1, Duration::from_millis(200)).expect("gateway");
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Manager);

        {
            let mut conn = gateway.acquire(Some(&ctx)).expect("acquire");
            assert!(conn.validate_context().expect("readback").matches(&ctx));
        }

        let mut reused = gateway.acquire(None).expect("reacquire");
        assert!(!reused.validate_context().expect("readback").is_set);
    }

    #[test]
    fn test_failed_commit_leaves_no_audit_record() {
        let desk = desk();
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let id = seed(&desk, &ctx, 1)[0];

        let mut uow = desk.gateway.enter(&ctx).expect("enter");
        update_ticket(
            &mut uow,
            &desk.policy,
            &desk.audit,
            id,
            UpdateTicketRequest::status("resolved"),
        )
        .expect("update");
        desk.db.fail_next_commit();
        assert!(desk.audit.commit(uow).is_err());

        let trail = desk
            .audit
            .audit_trail(&desk.gateway, &ctx, ENTITY_TICKET, &id.to_string())
            .expect("trail");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "ticket.created");

        let ticket = list_tickets(&desk.gateway, Some(&ctx)).expect("list").remove(0);
        assert_eq!(ticket.status, "open");
    }

    #[test]
    fn test_every_committed_mutation_has_one_audit_record() {
        let desk = desk();
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let id = seed(&desk, &ctx, 1)[0];

        for status in ["pending", "open", "resolved"] {
            let mut uow = desk.gateway.enter(&ctx).expect("enter");
            update_ticket(&mut uow, &desk.policy, &desk.audit, id, UpdateTicketRequest::status(status))
                .expect("update");
            desk.audit.commit(uow).expect("commit");
        }

        let trail = desk
            .audit
            .audit_trail(&desk.gateway, &ctx, ENTITY_TICKET, &id.to_string())
            .expect("trail");
        assert_eq!(trail.len(), 4);
        assert!(trail.iter().all(|r| r.actor_id == Some(ctx.user_id)));

        let stranger = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Admin);
        assert!(desk
            .audit
            .audit_trail(&desk.gateway, &stranger, ENTITY_TICKET, &id.to_string())
            .expect("trail")
            .is_empty());
    }

    #[test]
    fn test_startup_check_names_unprotected_tables() {
        let desk = desk();
        assert!(desk.gateway.verify_row_security().is_ok());

        desk.db.disable_row_security("webhooks");
        match desk.gateway.verify_row_security() {
            Err(GovernanceError::RlsDisabled(tables)) => assert_eq!(tables, vec!["webhooks"]),
            other => panic!("expected RlsDisabled, got {other:?}"),
        }
    }
}
