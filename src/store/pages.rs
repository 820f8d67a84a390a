//! Page access matrix.

use super::{is_constraint_violation, FleetStore};
use crate::access::{
    lookup_candidates, normalize_path, seed, PageDefinition, PageRestriction,
    PAGE_RESTRICTIONS_PATH,
};
use crate::auth::model::Role;
use crate::error::AuthError;
use std::collections::HashMap;

const PAGE_COLUMNS: &str = "id, page_name, path, description, is_active";

fn read_page(row: &rusqlite::Row<'_>) -> rusqlite::Result<PageRestriction> {
    Ok(PageRestriction {
        id: row.get(0)?,
        page_name: row.get(1)?,
        path: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get(4)?,
        allowed_roles: Vec::new(),
    })
}

fn allowed_roles(conn: &rusqlite::Connection, page_id: i64) -> Result<Vec<Role>, AuthError> {
    let mut stmt = conn.prepare(
        "SELECT role FROM page_role_access WHERE page_id = ?1 AND allowed = 1 ORDER BY role",
    )?;
    let rows = stmt.query_map(rusqlite::params![page_id], |row| row.get::<_, String>(0))?;

    let mut roles = Vec::new();
    for role in rows {
        let role = role?;
        match role.parse::<Role>() {
            Ok(role) => roles.push(role),
            Err(_) => tracing::debug!(page_id, role = %role, "Skipping unknown role in access matrix"),
        }
    }
    roles.sort();
    Ok(roles)
}

fn page_by_path(conn: &rusqlite::Connection, path: &str) -> Result<Option<PageRestriction>, AuthError> {
    let row = conn.query_row(
        &format!("SELECT {PAGE_COLUMNS} FROM page_restrictions WHERE path = ?1"),
        rusqlite::params![path],
        read_page,
    );
    match row {
        Ok(mut page) => {
            page.allowed_roles = allowed_roles(conn, page.id)?;
            Ok(Some(page))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_role_flags(
    conn: &rusqlite::Connection,
    page_id: i64,
    allowed: &[Role],
) -> Result<(), AuthError> {
    for role in Role::ALL {
        conn.execute(
            "INSERT INTO page_role_access (page_id, role, allowed) VALUES (?1, ?2, ?3)
             ON CONFLICT(page_id, role) DO UPDATE SET allowed = excluded.allowed",
            rusqlite::params![page_id, role.as_str(), allowed.contains(&role)],
        )?;
    }
    Ok(())
}

impl FleetStore {
    // ── Seeding ─────────────────────────────────────────────────────

    /// Insert pages that are not registered yet. Existing rows (and any
    /// edits made to them) are left alone. Returns the number inserted.
    pub fn seed_pages(&self, pages: &[PageDefinition]) -> Result<usize, AuthError> {
        let now = self.now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;

        for def in pages {
            let path = normalize_path(&def.path)?;
            let changed = tx.execute(
                "INSERT OR IGNORE INTO page_restrictions (page_name, path, description, is_active, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                rusqlite::params![def.page_name, path, def.description, now],
            )?;
            if changed == 0 {
                continue;
            }
            write_role_flags(&tx, tx.last_insert_rowid(), &def.allowed_roles)?;
            inserted += 1;
        }
        tx.commit()?;

        if inserted > 0 {
            tracing::info!(inserted, "Seeded page restrictions");
        }
        Ok(inserted)
    }

    pub fn seed_default_pages(&self) -> Result<usize, AuthError> {
        self.seed_pages(&seed::default_pages())
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Every page, active or not, ordered by path.
    pub fn list_pages(&self) -> Result<Vec<PageRestriction>, AuthError> {
        let conn = self.conn.lock();
        let mut pages = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAGE_COLUMNS} FROM page_restrictions ORDER BY path"
            ))?;
            let rows = stmt.query_map([], read_page)?;
            let pages = rows.collect::<Result<Vec<_>, _>>()?;
            pages
        };

        let mut flags: HashMap<i64, Vec<Role>> = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT page_id, role FROM page_role_access WHERE allowed = 1")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (page_id, role) = row?;
                if let Ok(role) = role.parse::<Role>() {
                    flags.entry(page_id).or_default().push(role);
                }
            }
        }

        for page in &mut pages {
            let mut roles = flags.remove(&page.id).unwrap_or_default();
            roles.sort();
            page.allowed_roles = roles;
        }
        Ok(pages)
    }

    /// Active pages whose flag for `role` is set.
    pub fn accessible_pages(&self, role: Role) -> Result<Vec<PageRestriction>, AuthError> {
        Ok(self
            .list_pages()?
            .into_iter()
            .filter(|page| page.allows(role))
            .collect())
    }

    /// The page governing `path`: an exact match, else the longest
    /// registered parent.
    pub fn find_page(&self, path: &str) -> Result<Option<PageRestriction>, AuthError> {
        let path = normalize_path(path)?;
        let conn = self.conn.lock();
        for candidate in lookup_candidates(&path) {
            if let Some(page) = page_by_path(&conn, candidate)? {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// Whether `role` may open `path`. Unknown, malformed and inactive
    /// paths are closed.
    pub fn check_access(&self, path: &str, role: Role) -> Result<bool, AuthError> {
        let page = match self.find_page(path) {
            Ok(page) => page,
            Err(AuthError::InvalidInput(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(page.is_some_and(|p| p.allows(role)))
    }

    /// Server-side guard. Any failure, including I/O, denies.
    pub fn require_access(&self, path: &str, role: Role) -> Result<(), AuthError> {
        match self.check_access(path, role) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::Forbidden),
            Err(e) => {
                tracing::warn!(path, role = %role, error = %e, "Access check failed, denying");
                Err(AuthError::Forbidden)
            }
        }
    }

    fn authorize_matrix_write(&self, actor: Role) -> Result<(), AuthError> {
        if actor == Role::Admin {
            return Ok(());
        }
        self.require_access(PAGE_RESTRICTIONS_PATH, actor)
    }

    // ── Administrative writes ───────────────────────────────────────

    /// Create a page or replace the name, description and role flags of
    /// the page registered at the same path.
    pub fn upsert_page(&self, actor: Role, def: &PageDefinition) -> Result<PageRestriction, AuthError> {
        self.authorize_matrix_write(actor)?;
        let path = normalize_path(&def.path)?;
        let page_name = def.page_name.trim();
        if page_name.is_empty() {
            return Err(AuthError::InvalidInput("page name cannot be empty".into()));
        }

        let now = self.now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let written = tx.execute(
            "INSERT INTO page_restrictions (page_name, path, description, is_active, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(path) DO UPDATE SET
                page_name = excluded.page_name,
                description = excluded.description,
                updated_at = excluded.updated_at",
            rusqlite::params![page_name, path, def.description, now],
        );
        match written {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(AuthError::InvalidInput(format!(
                    "page name '{page_name}' is already used by another path"
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let page_id: i64 = tx.query_row(
            "SELECT id FROM page_restrictions WHERE path = ?1",
            rusqlite::params![path],
            |row| row.get(0),
        )?;
        write_role_flags(&tx, page_id, &def.allowed_roles)?;
        let page = page_by_path(&tx, &path)?;
        tx.commit()?;

        tracing::info!(path = %path, actor = %actor, "Page restriction saved");
        page.ok_or_else(|| AuthError::TransientIo(format!("page {path} vanished after write")))
    }

    /// Set one role flag on the page registered at exactly `path`.
    /// Returns `false` when no such page exists.
    pub fn set_role_access(
        &self,
        actor: Role,
        path: &str,
        role: Role,
        allowed: bool,
    ) -> Result<bool, AuthError> {
        self.authorize_matrix_write(actor)?;
        let path = normalize_path(path)?;
        let now = self.now();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let page_id = match tx.query_row(
            "SELECT id FROM page_restrictions WHERE path = ?1",
            rusqlite::params![path],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => id,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        tx.execute(
            "INSERT INTO page_role_access (page_id, role, allowed) VALUES (?1, ?2, ?3)
             ON CONFLICT(page_id, role) DO UPDATE SET allowed = excluded.allowed",
            rusqlite::params![page_id, role.as_str(), allowed],
        )?;
        tx.execute(
            "UPDATE page_restrictions SET updated_at = ?2 WHERE id = ?1",
            rusqlite::params![page_id, now],
        )?;
        tx.commit()?;

        tracing::info!(path = %path, role = %role, allowed, actor = %actor, "Role access changed");
        Ok(true)
    }

    /// Pages are deactivated, never deleted.
    pub fn set_page_active(&self, actor: Role, path: &str, active: bool) -> Result<bool, AuthError> {
        self.authorize_matrix_write(actor)?;
        let path = normalize_path(path)?;
        let updated = self.conn.lock().execute(
            "UPDATE page_restrictions SET is_active = ?2, updated_at = ?3 WHERE path = ?1",
            rusqlite::params![path, active, self.now()],
        )?;
        if updated > 0 {
            tracing::info!(path = %path, active, actor = %actor, "Page active flag changed");
        }
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::store;
    use super::*;

    fn def(name: &str, path: &str, roles: &[Role]) -> PageDefinition {
        PageDefinition {
            page_name: name.to_string(),
            path: path.to_string(),
            description: None,
            allowed_roles: roles.to_vec(),
        }
    }

    #[test]
    fn driver_reaches_attendance_but_not_unregistered_users_page() {
        let (_clock, store) = store();
        store
            .seed_pages(&[def("Attendance", "/attendance", &[Role::Driver])])
            .unwrap();

        assert!(store.check_access("/attendance", Role::Driver).unwrap());
        assert!(!store.check_access("/users", Role::Driver).unwrap());
    }

    #[test]
    fn unknown_and_inactive_paths_are_closed_for_every_role() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();
        store.set_page_active(Role::Admin, "/reports", false).unwrap();

        for role in Role::ALL {
            assert!(!store.check_access("/no-such-page", role).unwrap());
            assert!(!store.check_access("/reports", role).unwrap());
            assert!(!store.check_access("not a path", role).unwrap());
        }
    }

    #[test]
    fn nested_routes_inherit_the_longest_parent() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();

        assert!(store.check_access("/vehicles/42/edit?tab=docs", Role::Mechanic).unwrap());
        assert!(!store.check_access("/vehicles/42", Role::Driver).unwrap());
        assert_eq!(
            store.find_page("/settings/page-restrictions/").unwrap().unwrap().path,
            PAGE_RESTRICTIONS_PATH
        );
        // The dashboard does not cover unregistered top-level routes
        assert!(store.find_page("/payroll").unwrap().is_none());
    }

    #[test]
    fn seeding_twice_keeps_edits() {
        let (_clock, store) = store();
        let first = store.seed_default_pages().unwrap();
        assert!(first > 0);
        store
            .set_role_access(Role::Admin, "/reports", Role::Dispatcher, true)
            .unwrap();

        assert_eq!(store.seed_default_pages().unwrap(), 0);
        assert!(store.check_access("/reports", Role::Dispatcher).unwrap());
    }

    #[test]
    fn accessible_pages_lists_only_active_allowed_pages() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();
        store.set_page_active(Role::Admin, "/fuel", false).unwrap();

        let paths: Vec<String> = store
            .accessible_pages(Role::Driver)
            .unwrap()
            .into_iter()
            .map(|p| p.path)
            .collect();
        assert_eq!(paths, vec!["/", "/attendance", "/incidents", "/trips"]);
    }

    #[test]
    fn non_admin_without_matrix_access_cannot_write() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();

        assert_eq!(
            store.set_role_access(Role::FleetManager, "/users", Role::Driver, true),
            Err(AuthError::Forbidden)
        );
        assert_eq!(
            store.set_page_active(Role::Driver, "/users", false),
            Err(AuthError::Forbidden)
        );
        assert!(!store.check_access("/users", Role::Driver).unwrap());
    }

    #[test]
    fn role_granted_the_matrix_page_may_write() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();
        store
            .set_role_access(Role::Admin, PAGE_RESTRICTIONS_PATH, Role::FleetManager, true)
            .unwrap();

        assert!(store
            .set_role_access(Role::FleetManager, "/disposal", Role::Mechanic, true)
            .unwrap());
        assert!(store.check_access("/disposal", Role::Mechanic).unwrap());
    }

    #[test]
    fn upsert_replaces_flags_and_rejects_name_clash() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();

        let page = store
            .upsert_page(Role::Admin, &def("Fuel Cards", "/fuel/", &[Role::FleetManager]))
            .unwrap();
        assert_eq!(page.path, "/fuel");
        assert_eq!(page.page_name, "Fuel Cards");
        assert_eq!(page.allowed_roles, vec![Role::FleetManager]);
        assert!(!store.check_access("/fuel", Role::Driver).unwrap());

        assert!(matches!(
            store.upsert_page(Role::Admin, &def("Reports", "/analytics", &[Role::Admin])),
            Err(AuthError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_page_write_returns_false() {
        let (_clock, store) = store();
        assert!(!store
            .set_role_access(Role::Admin, "/ghost", Role::Driver, true)
            .unwrap());
        assert!(!store.set_page_active(Role::Admin, "/ghost", false).unwrap());
    }

    #[test]
    fn require_access_maps_denial_to_forbidden() {
        let (_clock, store) = store();
        store.seed_default_pages().unwrap();
        assert!(store.require_access("/users", Role::Admin).is_ok());
        assert_eq!(
            store.require_access("/users", Role::Mechanic),
            Err(AuthError::Forbidden)
        );
    }
}
