//! Endpoint resolution against an application's namespace.

use crate::application::{AppTables, Application};
use crate::endpoint::{SessionEndpoint, SessionEndpointCfg};
use crate::namespace::{NamespaceIndex, NamespaceRegistry};
use crate::providers::AddressTable;

/// Namespace a request of `app` is resolved in.
///
/// Transport applications act for the owner of the worker named in the
/// request, so they resolve in the owner's namespace.
pub fn namespace_for_request(
    sep: &SessionEndpointCfg,
    app: &Application,
    apps: &AppTables,
) -> NamespaceIndex {
    if !app.is_transport_app() {
        return app.ns_index;
    }
    sep.app_wrk_index
        .and_then(|wrk| apps.worker(wrk))
        .and_then(|owner_wrk| apps.app(owner_wrk.app_index))
        .map_or(app.ns_index, |owner| owner.ns_index)
}

/// Fill in routing table and interface constraints of `sep` from the
/// namespace the request resolves in.
///
/// Never fails. A caller-pinned peer interface that disagrees with the
/// namespace's interface is logged and overridden.
pub fn resolve_for_app(
    sep: &mut SessionEndpointCfg,
    app: &Application,
    is_connect: bool,
    namespaces: &NamespaceRegistry,
    apps: &AppTables,
) {
    let ns_index = namespace_for_request(sep, app, apps);
    let Some(ns) = namespaces.get(ns_index) else {
        return;
    };

    let fib_index = match sep.endpoint.fib_index {
        Some(requested) if ns_index.is_default() => requested,
        _ => ns.fib_index(sep.endpoint.fib_proto()),
    };
    sep.endpoint.fib_index = Some(fib_index);
    sep.peer.fib_index = Some(fib_index);

    if !is_connect {
        sep.endpoint.sw_if_index = ns.sw_if_index;
        return;
    }

    if let (Some(ns_if), Some(peer_if)) = (ns.sw_if_index, sep.peer.sw_if_index) {
        if ns_if != peer_if {
            tracing::warn!(
                app = %app.app_index,
                ns = %ns_index,
                requested = peer_if,
                namespace = ns_if,
                "local interface differs from namespace interface, using namespace's"
            );
        }
    }
    sep.peer.sw_if_index = ns.sw_if_index;
}

/// True if a resolved bind endpoint is actually reachable where it claims.
///
/// Local endpoints always are. A routed endpoint pinned to an interface must
/// find its address configured on that interface; otherwise the address
/// must be local in the endpoint's routing table.
pub fn endpoint_in_namespace(endpoint: &SessionEndpoint, addresses: &impl AddressTable) -> bool {
    if endpoint.is_local() {
        return true;
    }
    if let Some(sw_if_index) = endpoint.sw_if_index {
        if !addresses.has_local_address(sw_if_index, &endpoint.ip) {
            tracing::warn!(
                sw_if_index,
                ip = %endpoint.ip,
                "interface not configured with address"
            );
            return false;
        }
    }
    endpoint
        .fib_index
        .is_some_and(|fib_index| addresses.is_locally_reachable(fib_index, &endpoint.ip))
}
