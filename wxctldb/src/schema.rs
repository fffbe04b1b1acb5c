diesel::table! {
    kv_store (bucket, key) {
        bucket -> Text,
        key -> Text,
        value -> Text,
    }
}
