diesel::table! {
    users (matrix_username) {
        matrix_username -> Text,
        matrix_private_room -> Nullable<Text>,
        github_username -> Nullable<Text>,
        gitter_id -> Nullable<Text>,
        gitter_access_token -> Nullable<Text>,
    }
}

diesel::table! {
    virtual_users (matrix_username) {
        matrix_username -> Text,
    }
}

diesel::table! {
    rooms (id) {
        id -> Integer,
        user -> Text,
        matrix_room -> Text,
        gitter_room_name -> Text,
        gitter_room_id -> Text,
    }
}

diesel::table! {
    virtual_user_rooms (id) {
        id -> Integer,
        matrix_username -> Text,
        matrix_room -> Text,
    }
}
