pub mod routes;
pub mod serve;

use gantry_gateway::Route;

/// One line per route: method, template and operation
pub fn route_line(route: &Route) -> String {
    format!("{}\t{}\t{}", route.method(), route.template(), route.operation())
}
