diesel::table! {
    products (id) {
        id -> Int8,
        name -> Varchar,
        price -> Numeric,
        stock_quantity -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    carts (id) {
        id -> Int8,
        account_id -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    cart_items (id) {
        id -> Int8,
        cart_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
        added_at -> Timestamptz,
    }
}

diesel::table! {
    order_requests (id) {
        id -> Int8,
        account_id -> Int8,
        full_name -> Varchar,
        phone -> Varchar,
        email -> Varchar,
        delivery_type -> Varchar,
        pickup_point_id -> Nullable<Int8>,
        payment_method -> Varchar,
        comment -> Text,
        accept_terms -> Bool,
        cart_snapshot -> Jsonb,
        total_amount -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Varchar,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(cart_items -> carts (cart_id));
diesel::joinable!(cart_items -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    carts,
    cart_items,
    order_requests,
    outbox_events,
);
