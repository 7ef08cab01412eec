//! Lead pipeline: an owner-scoped Kanban board of sales leads.
//!
//! ## Overview
//!
//! Each account sees its own leads grouped into five fixed stages. Moving a
//! lead between stages is optimistic: the board changes at once and is
//! reconciled with the store afterwards, reverting if the store does not
//! confirm the write.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs      (handlers, AppState)           │
//! └──────────┘ WebSocket│    ├─ session.rs  (Account from headers)         │
//!                       │    └─ ws.rs       (event stream per account)     │
//!                       │         │                                        │
//!                       │         │ one PipelineController per account     │
//!                       │         v                                        │
//!                       │  controller.rs  (optimistic transitions, CRUD)   │
//!                       │         │                 │                      │
//!                       │         │ LeadStore       │ board::partition     │
//!                       │         v                 v                      │
//!                       │  store.rs / db.rs     board.rs                   │
//!                       │  (trait + SQLite)     (stage columns)            │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                           |
//! |--------------|----------------------------------------------------------|
//! | `models`     | `Lead`, `Stage`, `Account`, `LeadDraft`, board views     |
//! | `validation` | Required fields, email shape, currency text to cents     |
//! | `events`     | `PipelineEvent` enum + `broadcast_event()` helper        |
//!
//! ## Stage Change Flow (drag a card to "Meeting")
//!
//! 1. `PATCH /api/leads/{id}/stage` → `controller.request_stage_transition()`
//! 2. The lead shows `Meeting` immediately and is marked pending; further
//!    moves of that lead are refused until this one settles.
//! 3. If the stage the store last confirmed is already `Meeting`, nothing is
//!    written.
//! 4. Otherwise `LeadStore::update_stage` runs, scoped by lead id and owner,
//!    under the configured timeout.
//! 5. One or more affected rows commits the move. An error, a timeout or
//!    zero affected rows puts the previous stage back and emits
//!    `LeadMoveReverted` plus an error notice.

pub mod api;
pub mod board;
pub mod controller;
pub mod db;
pub mod events;
pub mod models;
pub mod server;
pub mod session;
pub mod store;
pub mod validation;
pub mod ws;
