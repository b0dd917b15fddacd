//! The shared route catalog: every endpoint either peer may invoke.
//!
//! A catalog is declared once and given, in identical form, to both
//! sides of a connection.  It pins the input and output shape of every
//! endpoint, so that neither side has to trust the other's payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::validate::Validator;

/// Which peer executes a call.
///
/// A connection always has exactly one `Server` and one `Client`; the
/// names come from who dialed whom, not from who may call whom.  Both
/// sides expose endpoints.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(clippy::exhaustive_enums)]
pub enum Side {
    /// The peer that accepted the connection.
    Server,
    /// The peer that dialed the connection.
    Client,
}

impl Side {
    /// Return the other side of the connection.
    pub fn opposite(self) -> Side {
        match self {
            Side::Server => Side::Client,
            Side::Client => Side::Server,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Server => write!(f, "server"),
            Side::Client => write!(f, "client"),
        }
    }
}

/// The two shapes an endpoint can have.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(clippy::exhaustive_enums)]
pub enum EndpointKind {
    /// Request, then exactly one reply.
    Proc,
    /// Request, then a lazy sequence of chunks and one terminal event.
    Streamer,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Proc => write!(f, "proc"),
            EndpointKind::Streamer => write!(f, "streamer"),
        }
    }
}

/// The shape checks for a single endpoint.
#[derive(Clone, Debug)]
pub struct Route {
    /// Applied to call arguments, on both the caller and callee side.
    input: Validator,
    /// Applied to every produced value: the unary result, or each
    /// stream chunk.
    output: Validator,
}

impl Route {
    /// Declare a route from its input and output validators.
    pub fn new(input: Validator, output: Validator) -> Self {
        Route { input, output }
    }

    /// Return the validator for call arguments.
    pub fn input(&self) -> &Validator {
        &self.input
    }

    /// Return the validator for produced values.
    pub fn output(&self) -> &Validator {
        &self.output
    }
}

/// The immutable endpoint catalog shared by both peers.
///
/// Uniqueness invariant: `(side, kind, name)` identifies at most one
/// route.  A name may repeat across kinds or sides.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    /// Routes, grouped by side and kind for borrowed-name lookup.
    routes: HashMap<(Side, EndpointKind), HashMap<Box<str>, Route>>,
}

impl Catalog {
    /// Return a builder for declaring a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Look up the route for `(side, kind, name)`, if there is one.
    pub fn route(&self, side: Side, kind: EndpointKind, name: &str) -> Option<&Route> {
        self.routes.get(&(side, kind)).and_then(|m| m.get(name))
    }

    /// Return true if `(side, kind, name)` names a route.
    pub fn contains(&self, side: Side, kind: EndpointKind, name: &str) -> bool {
        self.route(side, kind, name).is_some()
    }

    /// Return the number of declared routes.
    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    /// Return true if no routes were declared.
    pub fn is_empty(&self) -> bool {
        self.routes.values().all(HashMap::is_empty)
    }
}

/// An error from declaring a [`Catalog`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// The same `(side, kind, name)` triple was declared twice.
    #[error("duplicate route: {kind} {name:?} declared twice on the {side} side")]
    DuplicateRoute {
        /// Side of the colliding declarations.
        side: Side,
        /// Kind of the colliding declarations.
        kind: EndpointKind,
        /// Endpoint name that collided.
        name: String,
    },
}

/// Builder for a [`Catalog`].
///
/// Declarations are checked for uniqueness when [`build`](Self::build)
/// runs, so a bad catalog fails loudly at startup rather than at call
/// time.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    /// Declarations in the order they were made.
    declared: Vec<(Side, EndpointKind, String, Route)>,
}

impl CatalogBuilder {
    /// Declare a unary procedure on `side`.
    pub fn proc(self, side: Side, name: &str, input: Validator, output: Validator) -> Self {
        self.declare(side, EndpointKind::Proc, name, Route::new(input, output))
    }

    /// Declare a streamer on `side`.
    pub fn streamer(self, side: Side, name: &str, input: Validator, output: Validator) -> Self {
        self.declare(side, EndpointKind::Streamer, name, Route::new(input, output))
    }

    /// Record one declaration.
    fn declare(mut self, side: Side, kind: EndpointKind, name: &str, route: Route) -> Self {
        self.declared.push((side, kind, name.to_owned(), route));
        self
    }

    /// Check uniqueness and build the catalog.
    pub fn build(self) -> Result<Catalog, CatalogError> {
        let mut catalog = Catalog::default();
        for (side, kind, name, route) in self.declared {
            let group = catalog.routes.entry((side, kind)).or_default();
            if group
                .insert(name.clone().into_boxed_str(), route)
                .is_some()
            {
                return Err(CatalogError::DuplicateRoute { side, kind, name });
            }
        }
        Ok(catalog)
    }
}
