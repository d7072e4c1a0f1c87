// Table definitions for the coordination store.
//
// Column order here MUST match the Queryable structs in src/models/ exactly.

diesel::table! {
    users (id) {
        id -> Text,
        balance_minor -> BigInt,
        currency -> Text,
        auto_cashout_enabled -> Bool,
        min_cashout_minor -> BigInt,
        bank_account_number -> Nullable<Text>,
        bank_code -> Nullable<Text>,
        bank_account_name -> Nullable<Text>,
        crypto_address -> Nullable<Text>,
        crypto_currency -> Nullable<Text>,
        crypto_network -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    escrows (id) {
        id -> Text,
        buyer_id -> Text,
        seller_id -> Text,
        amount_minor -> BigInt,
        currency -> Text,
        fee_minor -> BigInt,
        status -> Text,
        payment_confirmed_at -> Nullable<Timestamp>,
        expires_at -> Nullable<Timestamp>,
        processed_for_refund -> Bool,
        notified_buyers -> Bool,
        cancel_reason -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    cashouts (id) {
        id -> Text,
        user_id -> Text,
        amount_minor -> BigInt,
        currency -> Text,
        status -> Text,
        destination_json -> Text,
        backend_pending -> Bool,
        external_txid -> Nullable<Text>,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    refunds (id) {
        id -> Text,
        escrow_id -> Nullable<Text>,
        user_id -> Text,
        source -> Text,
        amount_minor -> BigInt,
        status -> Text,
        fingerprint -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    idempotency_keys (key, scope) {
        key -> Text,
        scope -> Text,
        status -> Text,
        created_at -> Timestamp,
        completed_at -> Nullable<Timestamp>,
        result_digest -> Nullable<Text>,
    }
}

diesel::table! {
    webhook_events (id) {
        id -> Text,
        escrow_id -> Text,
        provider -> Text,
        payload_json -> Text,
        amount_minor -> BigInt,
        currency -> Text,
        status -> Text,
        external_txid -> Text,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    transactions (id) {
        id -> Text,
        escrow_id -> Nullable<Text>,
        external_id -> Text,
        user_id -> Text,
        kind -> Text,
        amount_minor -> BigInt,
        currency -> Text,
        usd_rate -> Nullable<Text>,
        created_at -> Timestamp,
    }
}

diesel::table! {
    work_items (id) {
        id -> Text,
        kind -> Text,
        escrow_id -> Nullable<Text>,
        payload_json -> Text,
        status -> Text,
        attempts -> Integer,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    users,
    escrows,
    cashouts,
    refunds,
    idempotency_keys,
    webhook_events,
    transactions,
    work_items,
);
