//! Collaborative session engine.
//!
//! | Module        | Role                                                        |
//! |---------------|-------------------------------------------------------------|
//! | `room`        | Per-project state machine: participants, tree, chat, runs   |
//! | `registry`    | Live room map, one room per project id                      |
//! | `router`      | Classifies inbound messages and applies them to rooms       |
//! | `transport`   | Per-project broadcast topics with addressed events          |
//! | `resolver`    | Ordered route fallback for durable writes                   |
//! | `store`       | Durable store seam, HTTP and in-memory backends             |
//! | `persistence` | Message and file-tree wire formats over the resolver        |
//! | `persister`   | Per-room write-behind task                                  |
//! | `sandbox`     | Execution sandbox seam and local process implementation     |
//! | `coordinator` | Drives sandbox runs from room snapshots                     |
//! | `identity`    | Credential extraction and identity providers                |
//! | `assistant`   | `@ai` prompt relay                                          |
//! | `api`, `ws`   | HTTP and WebSocket surface                                  |
//! | `server`      | Component wiring and the axum server                        |

pub mod api;
pub mod assistant;
pub mod coordinator;
pub mod identity;
pub mod persistence;
pub mod persister;
pub mod registry;
pub mod resolver;
pub mod room;
pub mod router;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod transport;
pub mod ws;
