//! Route identifiers.
//!
//! A route is an opaque string naming an addressable endpoint. The helpers
//! below build the conventional prefixed forms.

/// The control route of whichever router receives the message.
pub const CONTROL_ROUTE: &str = "$control";

/// The control route of the root router. Sub-routers escalate it upstream.
pub const CONTROL_ROOT_ROUTE: &str = "$control:root";

/// Route of the main server endpoint; requests with no route land here.
pub const DEFAULT_ROUTE: &str = "server";

pub fn make_connection_route_id(conn: &str) -> String {
    format!("conn:{}", conn)
}

pub fn make_proc_route_id(proc_id: &str) -> String {
    format!("proc:{}", proc_id)
}

pub fn make_random_proc_route_id() -> String {
    make_proc_route_id(&uuid::Uuid::new_v4().to_string())
}

pub fn make_controller_route_id(block_id: &str) -> String {
    format!("controller:{}", block_id)
}

pub fn make_tab_route_id(tab_id: &str) -> String {
    format!("tab:{}", tab_id)
}

pub fn is_control_route(route: &str) -> bool {
    route == CONTROL_ROUTE || route == CONTROL_ROOT_ROUTE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_prefixes() {
        assert_eq!(make_connection_route_id("local"), "conn:local");
        assert_eq!(make_controller_route_id("b1"), "controller:b1");
        assert_eq!(make_tab_route_id("t1"), "tab:t1");
    }

    #[test]
    fn test_random_proc_routes_are_unique() {
        let a = make_random_proc_route_id();
        let b = make_random_proc_route_id();
        assert!(a.starts_with("proc:"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_control_routes() {
        assert!(is_control_route(CONTROL_ROUTE));
        assert!(is_control_route(CONTROL_ROOT_ROUTE));
        assert!(!is_control_route(DEFAULT_ROUTE));
    }
}
