use diesel::prelude::*;

use crate::schema::{rooms, users, virtual_user_rooms, virtual_users};

#[derive(Queryable, Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = users)]
#[diesel(primary_key(matrix_username))]
pub struct User {
    pub matrix_username: String,
    pub matrix_private_room: Option<String>,
    pub github_username: Option<String>,
    pub gitter_id: Option<String>,
    pub gitter_access_token: Option<String>,
}

impl User {
    /// A user is authenticated iff all three Gitter fields are set (spec.md §3).
    pub fn is_authenticated(&self) -> bool {
        self.github_username.is_some() && self.gitter_id.is_some() && self.gitter_access_token.is_some()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub matrix_username: &'a str,
    pub matrix_private_room: Option<&'a str>,
    pub github_username: Option<&'a str>,
    pub gitter_id: Option<&'a str>,
    pub gitter_access_token: Option<&'a str>,
}

#[derive(Queryable, Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = virtual_users)]
#[diesel(primary_key(matrix_username))]
pub struct VirtualUser {
    pub matrix_username: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = virtual_users)]
pub struct NewVirtualUser<'a> {
    pub matrix_username: &'a str,
}

#[derive(Queryable, Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = rooms)]
pub struct BridgedRoom {
    pub id: i32,
    pub user: String,
    pub matrix_room: String,
    pub gitter_room_name: String,
    pub gitter_room_id: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = rooms)]
pub struct NewBridgedRoom<'a> {
    pub user: &'a str,
    pub matrix_room: &'a str,
    pub gitter_room_name: &'a str,
    pub gitter_room_id: &'a str,
}

#[derive(Queryable, Identifiable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = virtual_user_rooms)]
pub struct VirtualUserRoom {
    pub id: i32,
    pub matrix_username: String,
    pub matrix_room: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = virtual_user_rooms)]
pub struct NewVirtualUserRoom<'a> {
    pub matrix_username: &'a str,
    pub matrix_room: &'a str,
}
