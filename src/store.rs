use std::collections::HashMap;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_query;

use crate::error::BridgeError;
use crate::models::{
    BridgedRoom, NewBridgedRoom, NewUser, NewVirtualUser, NewVirtualUserRoom, User, VirtualUser,
};
use crate::schema::{rooms, users, virtual_user_rooms, virtual_users};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        matrix_username TEXT PRIMARY KEY,
        matrix_private_room TEXT UNIQUE,
        github_username TEXT,
        gitter_id TEXT,
        gitter_access_token TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_users_github_username ON users(github_username)",
    "CREATE TABLE IF NOT EXISTS virtual_users (
        matrix_username TEXT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user TEXT NOT NULL,
        matrix_room TEXT NOT NULL,
        gitter_room_name TEXT NOT NULL,
        gitter_room_id TEXT NOT NULL,
        UNIQUE(user, matrix_room)
    )",
    "CREATE TABLE IF NOT EXISTS virtual_user_rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        matrix_username TEXT NOT NULL,
        matrix_room TEXT NOT NULL,
        UNIQUE(matrix_username, matrix_room)
    )",
];

/// Durable registry over the five logical relations of spec.md §3, backed by
/// SQLite through a diesel r2d2 pool. Tables are created on first run with
/// `CREATE TABLE IF NOT EXISTS`, mirroring the original Python source's
/// runtime table bootstrap rather than a migrations directory.
pub struct Store {
    pool: DbPool,
}

impl Store {
    pub fn new(database_url: &str) -> Result<Self, BridgeError> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        // SQLite serializes writers anyway, and a pool size > 1 against
        // `:memory:` would hand out unrelated empty databases; one
        // connection matches the single-writer model of the dispatch loop.
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| BridgeError::other(format!("failed to build db pool: {e}")))?;
        let mut conn = pool.get()?;
        for stmt in CREATE_TABLES {
            sql_query(*stmt).execute(&mut conn)?;
        }
        Ok(Store { pool })
    }

    pub fn get_user_by_matrix_username(&self, username: &str) -> Result<Option<User>, BridgeError> {
        let mut conn = self.pool.get()?;
        Ok(users::table
            .find(username)
            .first::<User>(&mut conn)
            .optional()?)
    }

    pub fn get_user_by_private_room(&self, room: &str) -> Result<Option<User>, BridgeError> {
        let mut conn = self.pool.get()?;
        Ok(users::table
            .filter(users::matrix_private_room.eq(room))
            .first::<User>(&mut conn)
            .optional()?)
    }

    pub fn get_user_by_github_username(&self, github: &str) -> Result<Option<User>, BridgeError> {
        let mut conn = self.pool.get()?;
        Ok(users::table
            .filter(users::github_username.eq(github))
            .first::<User>(&mut conn)
            .optional()?)
    }

    /// Idempotent insert; returns the (possibly pre-existing) User row.
    pub fn create_user(&self, matrix_username: &str) -> Result<User, BridgeError> {
        let mut conn = self.pool.get()?;
        if let Some(existing) = users::table
            .find(matrix_username)
            .first::<User>(&mut conn)
            .optional()?
        {
            return Ok(existing);
        }
        let new_user = NewUser {
            matrix_username,
            matrix_private_room: None,
            github_username: None,
            gitter_id: None,
            gitter_access_token: None,
        };
        diesel::insert_into(users::table)
            .values(&new_user)
            .execute(&mut conn)?;
        Ok(users::table.find(matrix_username).first(&mut conn)?)
    }

    pub fn set_gitter_info(
        &self,
        matrix_username: &str,
        github_username: &str,
        gitter_id: &str,
        token: &str,
    ) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        diesel::update(users::table.find(matrix_username))
            .set((
                users::github_username.eq(github_username),
                users::gitter_id.eq(gitter_id),
                users::gitter_access_token.eq(token),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn clear_gitter_info(&self, matrix_username: &str) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        diesel::update(users::table.find(matrix_username))
            .set((
                users::github_username.eq(None::<String>),
                users::gitter_id.eq(None::<String>),
                users::gitter_access_token.eq(None::<String>),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    /// Writes the new private room pointer, enforcing global uniqueness of
    /// the value (invariant 2), and returns the user's previous value.
    pub fn set_private_room(
        &self,
        matrix_username: &str,
        room: &str,
    ) -> Result<Option<String>, BridgeError> {
        let mut conn = self.pool.get()?;
        conn.transaction(|conn| {
            let previous: Option<String> = users::table
                .find(matrix_username)
                .select(users::matrix_private_room)
                .first(conn)?;
            diesel::update(users::table.filter(users::matrix_private_room.eq(room)))
                .set(users::matrix_private_room.eq(None::<String>))
                .execute(conn)?;
            diesel::update(users::table.find(matrix_username))
                .set(users::matrix_private_room.eq(room))
                .execute(conn)?;
            Ok(previous)
        })
    }

    pub fn clear_private_room_by_value(&self, room: &str) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        diesel::update(users::table.filter(users::matrix_private_room.eq(room)))
            .set(users::matrix_private_room.eq(None::<String>))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn insert_bridged_room(
        &self,
        user: &str,
        matrix_room: &str,
        gitter_name: &str,
        gitter_id: &str,
    ) -> Result<BridgedRoom, BridgeError> {
        let mut conn = self.pool.get()?;
        conn.transaction(|conn| {
            let existing = rooms::table
                .filter(rooms::user.eq(user))
                .filter(rooms::matrix_room.eq(matrix_room))
                .first::<BridgedRoom>(conn)
                .optional()?;
            if let Some(existing) = existing {
                return Ok(existing);
            }
            diesel::insert_into(rooms::table)
                .values(&NewBridgedRoom {
                    user,
                    matrix_room,
                    gitter_room_name: gitter_name,
                    gitter_room_id: gitter_id,
                })
                .execute(conn)?;
            Ok(rooms::table
                .filter(rooms::user.eq(user))
                .filter(rooms::matrix_room.eq(matrix_room))
                .first(conn)?)
        })
    }

    pub fn delete_bridged_room(&self, user: &str, matrix_room: &str) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        diesel::delete(
            rooms::table
                .filter(rooms::user.eq(user))
                .filter(rooms::matrix_room.eq(matrix_room)),
        )
        .execute(&mut conn)?;
        Ok(())
    }

    /// All BridgedRooms joined with their owning User, for rebuilding the
    /// RoomLink index at startup.
    pub fn list_bridged_rooms(&self) -> Result<Vec<(BridgedRoom, User)>, BridgeError> {
        let mut conn = self.pool.get()?;
        let joined = rooms::table
            .inner_join(users::table.on(rooms::user.eq(users::matrix_username)))
            .load::<(BridgedRoom, User)>(&mut conn)?;
        Ok(joined)
    }

    pub fn list_bridged_room_ids_for_user(
        &self,
        matrix_username: &str,
    ) -> Result<HashMap<String, String>, BridgeError> {
        let mut conn = self.pool.get()?;
        let rows = rooms::table
            .filter(rooms::user.eq(matrix_username))
            .select((rooms::gitter_room_id, rooms::matrix_room))
            .load::<(String, String)>(&mut conn)?;
        Ok(rows.into_iter().collect())
    }

    pub fn virtual_user_exists(&self, name: &str) -> Result<bool, BridgeError> {
        let mut conn = self.pool.get()?;
        Ok(virtual_users::table
            .find(name)
            .first::<VirtualUser>(&mut conn)
            .optional()?
            .is_some())
    }

    pub fn add_virtual_user(&self, name: &str) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        if virtual_users::table
            .find(name)
            .first::<VirtualUser>(&mut conn)
            .optional()?
            .is_some()
        {
            return Ok(());
        }
        diesel::insert_into(virtual_users::table)
            .values(&NewVirtualUser { matrix_username: name })
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn virtual_user_in_room(&self, name: &str, room: &str) -> Result<bool, BridgeError> {
        let mut conn = self.pool.get()?;
        Ok(virtual_user_rooms::table
            .filter(virtual_user_rooms::matrix_username.eq(name))
            .filter(virtual_user_rooms::matrix_room.eq(room))
            .first::<crate::models::VirtualUserRoom>(&mut conn)
            .optional()?
            .is_some())
    }

    pub fn add_virtual_user_in_room(&self, name: &str, room: &str) -> Result<(), BridgeError> {
        let mut conn = self.pool.get()?;
        if self.virtual_user_in_room(name, room)? {
            return Ok(());
        }
        diesel::insert_into(virtual_user_rooms::table)
            .values(&NewVirtualUserRoom {
                matrix_username: name,
                matrix_room: room,
            })
            .execute(&mut conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::new(":memory:").expect("in-memory store")
    }

    #[test]
    fn create_user_is_idempotent() {
        let store = test_store();
        let a = store.create_user("@alice:example").unwrap();
        let b = store.create_user("@alice:example").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn set_private_room_enforces_global_uniqueness() {
        let store = test_store();
        store.create_user("@alice:example").unwrap();
        store.create_user("@bob:example").unwrap();

        let prev = store.set_private_room("@alice:example", "!priv:ex").unwrap();
        assert_eq!(prev, None);

        // Bob claiming the same room pointer steals it from Alice.
        store.set_private_room("@bob:example", "!priv:ex").unwrap();
        let alice = store
            .get_user_by_matrix_username("@alice:example")
            .unwrap()
            .unwrap();
        assert_eq!(alice.matrix_private_room, None);
        let bob = store
            .get_user_by_matrix_username("@bob:example")
            .unwrap()
            .unwrap();
        assert_eq!(bob.matrix_private_room.as_deref(), Some("!priv:ex"));
    }

    #[test]
    fn set_private_room_returns_previous_value() {
        let store = test_store();
        store.create_user("@alice:example").unwrap();
        store.set_private_room("@alice:example", "!a:ex").unwrap();
        let prev = store.set_private_room("@alice:example", "!b:ex").unwrap();
        assert_eq!(prev.as_deref(), Some("!a:ex"));
    }

    #[test]
    fn insert_bridged_room_is_unique_on_user_and_matrix_room() {
        let store = test_store();
        store.create_user("@alice:example").unwrap();
        let a = store
            .insert_bridged_room("@alice:example", "!m:ex", "org/repo", "R1")
            .unwrap();
        let b = store
            .insert_bridged_room("@alice:example", "!m:ex", "org/repo", "R1")
            .unwrap();
        assert_eq!(a.id, b.id);
        let all = store.list_bridged_rooms().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn add_virtual_user_is_idempotent() {
        let store = test_store();
        store.add_virtual_user("@gitter_bob:example").unwrap();
        store.add_virtual_user("@gitter_bob:example").unwrap();
        assert!(store.virtual_user_exists("@gitter_bob:example").unwrap());
    }

    #[test]
    fn virtual_user_in_room_idempotent() {
        let store = test_store();
        store
            .add_virtual_user_in_room("@gitter_bob:example", "!m:ex")
            .unwrap();
        store
            .add_virtual_user_in_room("@gitter_bob:example", "!m:ex")
            .unwrap();
        assert!(store
            .virtual_user_in_room("@gitter_bob:example", "!m:ex")
            .unwrap());
    }
}
