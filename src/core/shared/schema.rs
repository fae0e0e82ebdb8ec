diesel::table! {
    tickets (id) {
        id -> Uuid,
        organization_id -> Uuid,
        subject -> Varchar,
        description -> Nullable<Text>,
        status -> Varchar,
        priority -> Varchar,
        requester_id -> Nullable<Uuid>,
        assignee_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    audit_records (id) {
        id -> Uuid,
        organization_id -> Uuid,
        actor_id -> Nullable<Uuid>,
        action -> Varchar,
        entity_type -> Varchar,
        entity_id -> Varchar,
        old_values -> Nullable<Jsonb>,
        new_values -> Nullable<Jsonb>,
        ip_address -> Nullable<Varchar>,
        user_agent -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    policy_rules (id) {
        id -> Uuid,
        organization_id -> Nullable<Uuid>,
        name -> Varchar,
        description -> Nullable<Text>,
        target -> Varchar,
        action -> Varchar,
        effect -> Varchar,
        condition -> Jsonb,
        priority -> Int4,
        enabled -> Bool,
        created_by -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ai_provenance (id) {
        id -> Uuid,
        organization_id -> Uuid,
        ticket_id -> Nullable<Uuid>,
        feature -> Varchar,
        evidence -> Jsonb,
        confidence -> Float8,
        risk_score -> Float8,
        policy_decision -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ai_security_events (id) {
        id -> Uuid,
        organization_id -> Uuid,
        user_id -> Nullable<Uuid>,
        ticket_id -> Nullable<Uuid>,
        event_type -> Varchar,
        risk_score -> Float8,
        flags -> Jsonb,
        snippet_hash -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    copilot_runs (id) {
        id -> Uuid,
        organization_id -> Uuid,
        ticket_id -> Nullable<Uuid>,
        user_id -> Uuid,
        plan -> Nullable<Jsonb>,
        tool_trace -> Jsonb,
        output -> Nullable<Text>,
        model_id -> Varchar,
        latency_ms -> Nullable<Int8>,
        status -> Varchar,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    webhooks (id) {
        id -> Uuid,
        organization_id -> Uuid,
        url -> Varchar,
        secret -> Varchar,
        event_types -> Array<Text>,
        enabled -> Bool,
        failure_count -> Int4,
        last_triggered_at -> Nullable<Timestamptz>,
        last_failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_deliveries (id) {
        id -> Uuid,
        organization_id -> Uuid,
        webhook_id -> Uuid,
        event -> Varchar,
        attempts -> Int4,
        status -> Varchar,
        response_code -> Nullable<Int4>,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        completed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    tickets,
    audit_records,
    policy_rules,
    ai_provenance,
    ai_security_events,
    copilot_runs,
    webhooks,
    webhook_deliveries,
);

/// Every table carrying `organization_id`. Startup refuses to serve while any
/// of them lacks an active row filter.
pub const TENANT_TABLES: [&str; 8] = [
    "tickets",
    "audit_records",
    "policy_rules",
    "ai_provenance",
    "ai_security_events",
    "copilot_runs",
    "webhooks",
    "webhook_deliveries",
];
