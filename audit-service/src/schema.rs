diesel::table! {
    audit_log (id) {
        id -> Int8,
        event_id -> Uuid,
        essence -> Varchar,
        action -> Varchar,
        account_id -> Int8,
        payload -> Jsonb,
        recorded_at -> Timestamptz,
    }
}
