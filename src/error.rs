//! # Errors
//!
//! Every public session, queue and registry operation fails with a
//! [`SessionError`]. The enum is serde-serialisable so the owning process can
//! hand it back to a Remote mirror verbatim, and [`SessionError::kind`] folds
//! the variants into the flat [`ErrorKind`] set callers render.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{audio::state::SessionState, cluster::NodeId, session::ContextId};

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SessionError {
    /// Índice fuera de rango para la operación pedida.
    #[error("Posición inválida: `{index}`. La posición debe estar entre {min} y {max} para esta cola")]
    InvalidPosition { index: usize, min: usize, max: usize },

    /// Movimiento relativo fuera de rango; el rango es relativo al cursor actual.
    #[error("Movimiento inválido: `{offset}`. Los movimientos de esta cola deben estar entre `{min}` y `{max}`")]
    InvalidMovement { offset: i64, min: i64, max: i64 },

    #[error("La cola está vacía")]
    QueueEmpty,

    #[error("La cola está llena (máximo {max} canciones)")]
    QueueFull { max: usize },

    #[error("Transición no permitida: {from} -> {to}")]
    TransitionNotPermitted { from: SessionState, to: SessionState },

    /// El resultado del comando es desconocido: no se reintenta automáticamente.
    #[error("El proceso dueño `{owner}` no responde: {reason}")]
    OwnerUnreachable { owner: NodeId, reason: String },

    #[error("No existe sesión para el contexto {0}")]
    NoSession(ContextId),

    #[error("Ya existe una sesión local para el contexto {0}")]
    SessionAlreadyExists(ContextId),

    #[error("Error del motor de audio: {0}")]
    Engine(String),
}

/// Flat classification of [`SessionError`], stable across process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidPosition,
    QueueEmpty,
    QueueFull,
    TransitionNotPermitted,
    OwnerUnreachable,
    NoSession,
    SessionAlreadyExists,
    Engine,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPosition { .. } | Self::InvalidMovement { .. } => ErrorKind::InvalidPosition,
            Self::QueueEmpty => ErrorKind::QueueEmpty,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::TransitionNotPermitted { .. } => ErrorKind::TransitionNotPermitted,
            Self::OwnerUnreachable { .. } => ErrorKind::OwnerUnreachable,
            Self::NoSession(_) => ErrorKind::NoSession,
            Self::SessionAlreadyExists(_) => ErrorKind::SessionAlreadyExists,
            Self::Engine(_) => ErrorKind::Engine,
        }
    }

    pub(crate) fn unreachable(owner: &NodeId, reason: impl Into<String>) -> Self {
        Self::OwnerUnreachable {
            owner: owner.clone(),
            reason: reason.into(),
        }
    }

    /// `NoSession` es esperado cuando un evento del motor compite con el cierre.
    pub fn is_no_session(&self) -> bool {
        matches!(self, Self::NoSession(_))
    }
}
