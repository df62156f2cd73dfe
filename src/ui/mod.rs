// UI module - presentation-facing projections of engine state
//
// The core never depends on any UI toolkit. This module only provides the
// pure mapping from BatchState to render instructions that a UI layer calls
// on each snapshot poll (unidirectional dependency: UI -> core, never back).

pub mod bindings;

pub use bindings::{RenderModel, render};
