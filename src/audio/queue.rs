use rand::Rng;
use serenity::model::id::UserId;
use std::time::Duration;
use tracing::{debug, info};

use super::{policy::EnqueueMode, track::QueuedTrack};
use crate::error::{Result, SessionError};

/// Cola de una sesión: secuencia ordenada más un cursor.
///
/// Con la cola no vacía siempre se cumple `0 <= pos < len`. Toda operación
/// fallida deja secuencia y cursor intactos.
#[derive(Debug, Clone)]
pub struct MusicQueue {
    items: Vec<QueuedTrack>,
    pos: usize,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Vec::new(),
            pos: 0,
            max_size,
        }
    }

    /// Agrega un track según el modo de encolado; devuelve el índice usado.
    pub fn enqueue<R: Rng + ?Sized>(
        &mut self,
        item: QueuedTrack,
        mode: EnqueueMode,
        rng: &mut R,
    ) -> Result<usize> {
        let index = mode.placement(self, item.requested_by, rng);
        self.insert_at(item, index)?;
        Ok(index)
    }

    /// Agrega al final (FIFO).
    pub fn push(&mut self, item: QueuedTrack) -> Result<usize> {
        let index = self.items.len();
        self.insert_at(item, index)?;
        Ok(index)
    }

    /// Inserta en un índice explícito de `[0, len]`.
    ///
    /// Insertar en o antes del cursor lo desplaza, así el track actual sigue
    /// siendo el mismo.
    pub fn insert_at(&mut self, item: QueuedTrack, index: usize) -> Result<()> {
        let len = self.items.len();
        if index > len {
            return Err(SessionError::InvalidPosition { index, min: 0, max: len });
        }
        if len >= self.max_size {
            return Err(SessionError::QueueFull { max: self.max_size });
        }

        info!("➕ Agregado a la cola en posición {}: {}", index, item.title());
        self.items.insert(index, item);
        if len > 0 && index <= self.pos {
            self.pos += 1;
        }

        Ok(())
    }

    /// Movimiento relativo del cursor.
    ///
    /// `move_by(0)` nunca falla. El error reporta el rango de offsets legales
    /// calculado desde el cursor actual.
    pub fn move_by(&mut self, offset: i64) -> Result<usize> {
        if offset == 0 {
            return Ok(self.pos);
        }
        if self.items.is_empty() {
            return Err(SessionError::QueueEmpty);
        }

        let min = -(self.pos as i64);
        let max = (self.items.len() - 1 - self.pos) as i64;
        if offset < min || offset > max {
            return Err(SessionError::InvalidMovement { offset, min, max });
        }

        self.pos = (self.pos as i64 + offset) as usize;
        debug!("📍 Cursor movido {} -> {}", offset, self.pos);
        Ok(self.pos)
    }

    /// Posicionamiento absoluto del cursor dentro de `[0, len)`.
    pub fn set_position(&mut self, index: usize) -> Result<()> {
        if self.items.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        if index >= self.items.len() {
            return Err(SessionError::InvalidPosition {
                index,
                min: 0,
                max: self.items.len() - 1,
            });
        }

        self.pos = index;
        debug!("📍 Cursor en posición {}", index);
        Ok(())
    }

    pub fn current_track(&self) -> Result<&QueuedTrack> {
        self.items.get(self.pos).ok_or(SessionError::QueueEmpty)
    }

    /// Desde el cursor (incluido) hasta el final.
    pub fn remaining_tracks(&self) -> &[QueuedTrack] {
        if self.items.is_empty() {
            &[]
        } else {
            &self.items[self.pos..]
        }
    }

    /// Lo que sigue después del cursor.
    pub fn upcoming(&self) -> &[QueuedTrack] {
        if self.items.is_empty() {
            &[]
        } else {
            &self.items[self.pos + 1..]
        }
    }

    pub fn items(&self) -> &[QueuedTrack] {
        &self.items
    }

    pub fn cursor(&self) -> Option<usize> {
        (!self.items.is_empty()).then_some(self.pos)
    }

    pub fn is_at_start(&self) -> bool {
        self.pos == 0
    }

    pub fn is_at_end(&self) -> bool {
        self.items.is_empty() || self.pos + 1 == self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Elimina un track específico.
    ///
    /// Quitar el track del cursor deja el cursor sobre el siguiente (o sobre
    /// el nuevo último si era el final).
    pub fn remove(&mut self, index: usize) -> Result<QueuedTrack> {
        if self.items.is_empty() {
            return Err(SessionError::QueueEmpty);
        }
        if index >= self.items.len() {
            return Err(SessionError::InvalidPosition {
                index,
                min: 0,
                max: self.items.len() - 1,
            });
        }

        let removed = self.items.remove(index);
        if index < self.pos || (self.pos > 0 && self.pos == self.items.len()) {
            self.pos -= 1;
        }
        if self.items.is_empty() {
            self.pos = 0;
        }

        debug!("❌ Track eliminado en posición {}", index);
        Ok(removed)
    }

    /// Quita todos los tracks pendientes de un usuario.
    pub fn dequeue(&mut self, requester: UserId) -> usize {
        if self.items.is_empty() {
            return 0;
        }

        let original_len = self.items.len();
        let mut index = 0;
        self.items.retain(|item| {
            let keep = index <= self.pos || item.requested_by != requester;
            index += 1;
            keep
        });

        let removed = original_len - self.items.len();
        if removed > 0 {
            info!("🗑️ Eliminadas {} canciones del usuario", removed);
        }
        removed
    }

    /// Descarta todo lo que sigue al cursor.
    pub fn clear_upcoming(&mut self) -> usize {
        if self.items.is_empty() {
            return 0;
        }

        let removed = self.items.len() - self.pos - 1;
        self.items.truncate(self.pos + 1);
        if removed > 0 {
            info!("🗑️ Cola limpiada ({} canciones)", removed);
        }
        removed
    }

    pub fn total_duration(&self) -> Duration {
        self.items
            .iter()
            .filter_map(|item| item.track.duration)
            .sum()
    }
}
