#[cfg(test)]
mod policy_precedence_integration_tests {
    use helpdesk_core::core::config::PolicyConfig;
    use helpdesk_core::core::store::MemoryDatabase;
    use helpdesk_core::security::audit::AuditRecorder;
    use helpdesk_core::security::policy::{Condition, DecisionRequest, Effect, PolicyEngine, RuleDraft};
    use helpdesk_core::{GovernanceError, Role, SessionContext, TenantGateway};
    use std::time::Duration;
    use uuid::Uuid;

    fn setup() -> (TenantGateway, PolicyEngine, AuditRecorder, SessionContext) {
        let db = MemoryDatabase::new();
        let gateway = TenantGateway::in_memory(&db, 4, Duration::from_millis(200)).expect("gateway");
        let policy = PolicyEngine::new(&PolicyConfig::default());
        let audit = AuditRecorder::new();
        let admin = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Admin);

        let mut uow = gateway.enter(&admin).expect("enter");
        policy
            .create_rule(
                &mut uow,
                &audit,
                RuleDraft::new("replies-allowed", "ai.reply", "send", Effect::Allow).priority(100),
            )
            .expect("allow rule");
        policy
            .create_rule(
                &mut uow,
                &audit,
                RuleDraft::new("risky-replies-denied", "ai.reply", "send", Effect::Deny)
                    .priority(50)
                    .when(Condition::ge("risk_score", 0.5)),
            )
            .expect("deny rule");
        audit.commit(uow).expect("commit");

        (gateway, policy, audit, admin)
    }

    #[test]
    fn test_lower_priority_number_wins() {
        let (gateway, policy, _audit, admin) = setup();
        let agent = SessionContext::new(admin.organization_id, Uuid::new_v4(), Role::Agent);
        let mut conn = gateway.acquire(Some(&agent)).expect("acquire");

        let risky = DecisionRequest::new("ai.reply", "send", &agent).with("risk_score", 0.7);
        let decision = policy.evaluate(conn.read(), &risky).expect("evaluate");
        assert_eq!(decision.effect, Effect::Deny);
        assert_eq!(decision.rule_name.as_deref(), Some("risky-replies-denied"));

        let calm = DecisionRequest::new("ai.reply", "send", &agent).with("risk_score", 0.1);
        let decision = policy.evaluate(conn.read(), &calm).expect("evaluate");
        assert_eq!(decision.effect, Effect::Allow);
        assert_eq!(decision.rule_name.as_deref(), Some("replies-allowed"));

        match policy.enforce(conn.read(), &risky) {
            Err(GovernanceError::PolicyDeny { rule, .. }) => assert_eq!(rule, "risky-replies-denied"),
            other => panic!("expected PolicyDeny, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let (gateway, policy, _audit, admin) = setup();
        let mut conn = gateway.acquire(Some(&admin)).expect("acquire");
        let request = DecisionRequest::new("ai.reply", "send", &admin).with("risk_score", 0.5);

        let first = policy.evaluate(conn.read(), &request).expect("evaluate");
        for _ in 0..20 {
            assert_eq!(policy.evaluate(conn.read(), &request).expect("evaluate"), first);
        }
    }

    #[test]
    fn test_rules_stay_inside_their_tenant() {
        let (gateway, policy, _audit, _admin) = setup();
        let outsider = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        let mut conn = gateway.acquire(Some(&outsider)).expect("acquire");

        let request = DecisionRequest::new("ai.reply", "send", &outsider).with("risk_score", 0.9);
        let decision = policy.evaluate(conn.read(), &request).expect("evaluate");
        assert_eq!(decision.effect, Effect::Allow);
        assert_eq!(decision.rule_id, None);
    }

    #[test]
    fn test_rule_changes_are_audited_and_visible() {
        let (gateway, policy, audit, admin) = setup();
        let mut conn = gateway.acquire(Some(&admin)).expect("acquire");
        let rules = conn.read().policy_rules().expect("rules");
        drop(conn);
        let deny = rules
            .iter()
            .find(|r| r.name == "risky-replies-denied")
            .expect("deny rule")
            .clone();

        let mut uow = gateway.enter(&admin).expect("enter");
        policy.delete_rule(&mut uow, &audit, deny.id).expect("delete");
        audit.commit(uow).expect("commit");

        let trail = audit
            .audit_trail(&gateway, &admin, "policy_rule", &deny.id.to_string())
            .expect("trail");
        let actions: Vec<&str> = trail.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(actions, vec!["policy_rule.created", "policy_rule.deleted"]);

        let mut conn = gateway.acquire(Some(&admin)).expect("acquire");
        let request = DecisionRequest::new("ai.reply", "send", &admin).with("risk_score", 0.9);
        assert_eq!(
            policy.evaluate(conn.read(), &request).expect("evaluate").effect,
            Effect::Allow
        );
    }

    fn blanket_deny() -> RuleDraft {
        RuleDraft::new("replies-frozen", "ai.reply", "send", Effect::Deny).priority(1)
    }

    #[test]
    fn test_rolled_back_rule_is_not_enforced() {
        let (gateway, policy, audit, admin) = setup();
        let calm = DecisionRequest::new("ai.reply", "send", &admin).with("risk_score", 0.1);

        let mut uow = gateway.enter(&admin).expect("enter");
        policy.create_rule(&mut uow, &audit, blanket_deny()).expect("rule");
        let inside = policy.evaluate(uow.read(), &calm).expect("evaluate");
        assert_eq!(inside.effect, Effect::Deny);
        drop(uow);

        let mut conn = gateway.acquire(Some(&admin)).expect("acquire");
        let decision = policy.evaluate(conn.read(), &calm).expect("evaluate");
        assert_eq!(decision.effect, Effect::Allow);
        assert_eq!(decision.rule_name.as_deref(), Some("replies-allowed"));
        assert!(policy.cache().get(admin.organization_id).is_some());
    }

    #[test]
    fn test_committed_rule_wins_over_read_taken_while_open() {
        let (gateway, policy, audit, admin) = setup();
        let agent = SessionContext::new(admin.organization_id, Uuid::new_v4(), Role::Agent);
        let calm = DecisionRequest::new("ai.reply", "send", &agent).with("risk_score", 0.1);

        let mut uow = gateway.enter(&admin).expect("enter");
        policy.create_rule(&mut uow, &audit, blanket_deny()).expect("rule");

        let mut conn = gateway.acquire(Some(&agent)).expect("acquire");
        let before = policy.evaluate(conn.read(), &calm).expect("evaluate");
        assert_eq!(before.effect, Effect::Allow);
        drop(conn);

        audit.commit(uow).expect("commit");

        let mut conn = gateway.acquire(Some(&agent)).expect("acquire");
        let after = policy.evaluate(conn.read(), &calm).expect("evaluate");
        assert_eq!(after.effect, Effect::Deny);
        assert_eq!(after.rule_name.as_deref(), Some("replies-frozen"));
    }

    #[test]
    fn test_failed_commit_leaves_rules_unchanged() {
        let db = MemoryDatabase::new();
        let gateway = TenantGateway::in_memory(&db, 4, Duration::from_millis(200)).expect("gateway");
        let policy = PolicyEngine::new(&PolicyConfig::default());
        let audit = AuditRecorder::new();
        let admin = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Admin);
        let request = DecisionRequest::new("ai.reply", "send", &admin);

        let mut uow = gateway.enter(&admin).expect("enter");
        policy.create_rule(&mut uow, &audit, blanket_deny()).expect("rule");
        db.fail_next_commit();
        assert!(audit.commit(uow).is_err());

        let mut conn = gateway.acquire(Some(&admin)).expect("acquire");
        assert_eq!(policy.evaluate(conn.read(), &request).expect("evaluate").effect, Effect::Allow);
    }

    #[test]
    fn test_agents_cannot_write_rules() {
        let (gateway, policy, audit, admin) = setup();
        let agent = SessionContext::new(admin.organization_id, Uuid::new_v4(), Role::Agent);
        let mut uow = gateway.enter(&agent).expect("enter");
        let err = policy
            .create_rule(
                &mut uow,
                &audit,
                RuleDraft::new("self-service", "ticket.export", "export", Effect::Allow),
            )
            .expect_err("row filter must refuse");
        assert!(matches!(err, GovernanceError::Store(_)));
    }
}
