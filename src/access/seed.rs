//! Pages every new deployment starts with.

use super::{PageDefinition, PAGE_RESTRICTIONS_PATH};
use crate::auth::model::Role::{self, Admin, Dispatcher, Driver, FleetManager, Mechanic};

fn page(name: &str, path: &str, description: &str, roles: &[Role]) -> PageDefinition {
    PageDefinition {
        page_name: name.to_string(),
        path: path.to_string(),
        description: Some(description.to_string()),
        allowed_roles: roles.to_vec(),
    }
}

pub fn default_pages() -> Vec<PageDefinition> {
    vec![
        page("Dashboard", "/", "Fleet overview", &Role::ALL),
        page(
            "Vehicles",
            "/vehicles",
            "Vehicle registry and status",
            &[Admin, FleetManager, Dispatcher, Mechanic],
        ),
        page("Drivers", "/drivers", "Driver roster", &[Admin, FleetManager, Dispatcher]),
        page(
            "Maintenance",
            "/maintenance",
            "Service schedule and work orders",
            &[Admin, FleetManager, Mechanic],
        ),
        page("Trips", "/trips", "Trip log", &[Admin, FleetManager, Dispatcher, Driver]),
        page("Fuel", "/fuel", "Fuel purchases", &[Admin, FleetManager, Dispatcher, Driver]),
        page(
            "Incidents",
            "/incidents",
            "Accident and damage reports",
            &[Admin, FleetManager, Dispatcher, Driver],
        ),
        page("Disposal", "/disposal", "Vehicle disposal auctions", &[Admin, FleetManager]),
        page(
            "Attendance",
            "/attendance",
            "Shift check-in",
            &[Admin, FleetManager, Driver, Mechanic],
        ),
        page("Reports", "/reports", "Fleet reports", &[Admin, FleetManager]),
        page("Users", "/users", "User administration", &[Admin]),
        page(
            "Page Restrictions",
            PAGE_RESTRICTIONS_PATH,
            "Role access matrix",
            &[Admin],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::normalize_path;
    use std::collections::HashSet;

    #[test]
    fn seed_paths_are_canonical_and_unique() {
        let pages = default_pages();
        let mut seen = HashSet::new();
        for page in &pages {
            assert_eq!(normalize_path(&page.path).unwrap(), page.path);
            assert!(seen.insert(page.path.clone()), "duplicate {}", page.path);
        }
    }

    #[test]
    fn admin_reaches_every_seeded_page() {
        assert!(default_pages().iter().all(|p| p.allowed_roles.contains(&Admin)));
    }
}
