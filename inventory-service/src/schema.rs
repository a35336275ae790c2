diesel::table! {
    processed_events (event_key) {
        event_key -> Varchar,
        order_id -> Varchar,
        event_type -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        order_id -> Varchar,
        product_id -> Varchar,
        warehouse_id -> Varchar,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_movements (id) {
        id -> Uuid,
        product_id -> Varchar,
        movement_type -> Varchar,
        quantity -> Int4,
        before_quantity -> Int4,
        after_quantity -> Int4,
        reference_type -> Nullable<Varchar>,
        reference_id -> Nullable<Varchar>,
        reason -> Varchar,
        created_at -> Timestamptz,
        seq -> Int8,
    }
}

diesel::table! {
    stocks (id) {
        id -> Uuid,
        product_id -> Varchar,
        warehouse_id -> Varchar,
        available -> Int4,
        reserved -> Int4,
        total -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    processed_events,
    reservations,
    stock_movements,
    stocks,
);
