table! {
    users (id) {
        id -> Integer,
        username -> Text,
        password_hash -> Text,
    }
}

table! {
    posts (id) {
        id -> Integer,
        title -> Text,
        author -> Text,
        content -> Text,
        created_at -> Timestamp,
    }
}

table! {
    files (id) {
        id -> Integer,
        post_id -> Integer,
        stored_name -> Text,
    }
}

joinable!(files -> posts (post_id));

allow_tables_to_appear_in_same_query!(
    users,
    posts,
    files,
);
