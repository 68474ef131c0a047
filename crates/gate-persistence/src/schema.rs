//! Esquema Diesel escrito a mano; debe coincidir con `migrations/`.

diesel::table! {
    run_events (run_id, seq) {
        run_id -> Uuid,
        seq -> BigInt,
        level -> Text,
        kind_name -> Text,
        kind -> Jsonb,
        ts -> Timestamptz,
    }
}

diesel::table! {
    ledger_entries (id) {
        id -> Uuid,
        ts -> Timestamptz,
        reference -> Text,
        delta -> BigInt,
        reason -> Text,
        metadata -> Jsonb,
        idempotency_key -> Nullable<Text>,
    }
}

diesel::table! {
    flow_jobs (id) {
        id -> BigInt,
        stream -> Text,
        payload -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    flow_job_groups (stream, group_name) {
        stream -> Text,
        group_name -> Text,
        last_delivered -> BigInt,
    }
}

diesel::table! {
    flow_job_pending (stream, group_name, message_id) {
        stream -> Text,
        group_name -> Text,
        message_id -> BigInt,
        consumer -> Text,
        deliveries -> Integer,
        delivered_at -> Timestamptz,
    }
}

diesel::table! {
    flows (id, version) {
        id -> Uuid,
        version -> Integer,
        name -> Text,
        tenant -> Text,
        panel -> Text,
        spec -> Jsonb,
        active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    invocations (id) {
        id -> Uuid,
        post_id -> Text,
        agent_id -> Text,
        status -> Text,
        cost -> BigInt,
        trace_id -> Text,
        reference -> Text,
        text -> Text,
        panel -> Text,
        result -> Nullable<Jsonb>,
        degraded -> Bool,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(flow_job_pending -> flow_jobs (message_id));

diesel::allow_tables_to_appear_in_same_query!(run_events,
                                              ledger_entries,
                                              flow_jobs,
                                              flow_job_groups,
                                              flow_job_pending,
                                              flows,
                                              invocations);
