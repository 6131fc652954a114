diesel::table! {
    seckill_voucher (voucher_id) {
        voucher_id -> Int8,
        stock -> Int4,
        begin_time -> Timestamptz,
        end_time -> Timestamptz,
        created_at -> Nullable<Timestamptz>,
        updated_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    voucher_order (id) {
        id -> Int8,
        user_id -> Int8,
        voucher_id -> Int8,
        status -> Varchar,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(voucher_order -> seckill_voucher (voucher_id));

diesel::allow_tables_to_appear_in_same_query!(
    seckill_voucher,
    voucher_order,
);
