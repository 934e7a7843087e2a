//! Pure decision functions: where a new track goes ([`EnqueueMode`]) and what
//! happens when a track ends normally ([`RepeatPolicy`]). Nothing here touches
//! the engine, so both are testable against a bare [`MusicQueue`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{collections::HashMap, fmt, str::FromStr};

use super::queue::MusicQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    None,
    One,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnqueueMode {
    #[default]
    Fifo,
    Lifo,
    Random,
    Interlace,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatMode::None => write!(f, "none"),
            RepeatMode::One => write!(f, "one"),
            RepeatMode::All => write!(f, "all"),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(RepeatMode::None),
            "one" | "track" => Ok(RepeatMode::One),
            "all" | "queue" => Ok(RepeatMode::All),
            other => Err(format!("{other} no es un modo de repetición válido")),
        }
    }
}

impl fmt::Display for EnqueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueMode::Fifo => write!(f, "FIFO"),
            EnqueueMode::Lifo => write!(f, "LIFO"),
            EnqueueMode::Random => write!(f, "RANDOM"),
            EnqueueMode::Interlace => write!(f, "INTERLACE"),
        }
    }
}

impl FromStr for EnqueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(EnqueueMode::Fifo),
            "lifo" => Ok(EnqueueMode::Lifo),
            "random" => Ok(EnqueueMode::Random),
            "interlace" => Ok(EnqueueMode::Interlace),
            other => Err(format!("{other} no es un modo de encolado válido")),
        }
    }
}

impl EnqueueMode {
    /// Índice donde insertar un track nuevo de `requester`.
    ///
    /// Una cola vacía siempre recibe en 0. Con cursor, todos los modos
    /// insertan después de él, así que el cursor nunca se desplaza.
    pub fn placement<R: Rng + ?Sized>(
        self,
        queue: &MusicQueue,
        requester: UserId,
        rng: &mut R,
    ) -> usize {
        let Some(cursor) = queue.cursor() else {
            return 0;
        };
        let len = queue.len();

        match self {
            EnqueueMode::Fifo => len,
            EnqueueMode::Lifo => cursor + 1,
            EnqueueMode::Random => rng.gen_range(cursor + 1..=len),
            EnqueueMode::Interlace => interlace_placement(queue, cursor, requester),
        }
    }
}

/// Round-robin placement over the tracks after the cursor.
///
/// Each upcoming track belongs to a "round": the number of earlier upcoming
/// tracks by the same requester. A requester with `k` upcoming tracks gets
/// its new track in round `k`, i.e. before the first upcoming track of a
/// later round. The result never lands before the requester's own last
/// upcoming track, so one requester's tracks keep their relative order.
/// With nothing after the cursor this is the LIFO slot.
///
/// Batches are placed one track at a time with this rule. The fixed stride
/// `cursor + factor * (i + 1)` for item `i`, with `factor` the number of
/// distinct requesters plus one, is not used: it ignores tracks a requester
/// already has queued and can land past the end of the queue.
fn interlace_placement(queue: &MusicQueue, cursor: usize, requester: UserId) -> usize {
    let start = cursor + 1;
    let upcoming = queue.upcoming();

    let own_round = upcoming
        .iter()
        .filter(|item| item.requested_by == requester)
        .count();
    let floor = upcoming
        .iter()
        .rposition(|item| item.requested_by == requester)
        .map_or(start, |offset| start + offset + 1);

    let mut rounds: HashMap<UserId, usize> = HashMap::new();
    for (offset, item) in upcoming.iter().enumerate() {
        let seen = rounds.entry(item.requested_by).or_insert(0);
        let round = *seen;
        *seen += 1;

        let index = start + offset;
        if round > own_round && index >= floor {
            return index;
        }
    }

    queue.len()
}

/// What the event handler should do after a track finished normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Volver a reproducir el track actual, sin mover el cursor.
    Replay,
    /// Avanzar al índice dado.
    Next(usize),
    /// Fin de la cola con repetición total: volver al inicio.
    Wrap,
    /// Fin de la cola: no reiniciar.
    Halt,
}

impl Advance {
    /// Cursor to play from, if playback continues.
    pub fn target(self, cursor: usize) -> Option<usize> {
        match self {
            Advance::Replay => Some(cursor),
            Advance::Next(index) => Some(index),
            Advance::Wrap => Some(0),
            Advance::Halt => None,
        }
    }
}

pub struct RepeatPolicy;

impl RepeatPolicy {
    pub fn decide(mode: RepeatMode, cursor: usize, len: usize) -> Advance {
        let at_end = cursor + 1 >= len;
        match mode {
            RepeatMode::One => Advance::Replay,
            RepeatMode::All if at_end => Advance::Wrap,
            RepeatMode::None if at_end => Advance::Halt,
            RepeatMode::All | RepeatMode::None => Advance::Next(cursor + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::{QueuedTrack, Track};
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    const A: UserId = UserId::new(1);
    const B: UserId = UserId::new(2);
    const C: UserId = UserId::new(3);
    const Z: UserId = UserId::new(26);

    fn queue_of(requesters: &[UserId]) -> MusicQueue {
        let mut queue = MusicQueue::new(100);
        for (i, requester) in requesters.iter().enumerate() {
            let track = Track::new(format!("src-{i}"), format!("t{i}"));
            queue.push(QueuedTrack::new(track, *requester)).unwrap();
        }
        queue
    }

    fn requesters(queue: &MusicQueue) -> Vec<UserId> {
        queue.items().iter().map(|item| item.requested_by).collect()
    }

    fn interlace(queue: &mut MusicQueue, requester: UserId) -> usize {
        let mut rng = StdRng::seed_from_u64(7);
        let index = EnqueueMode::Interlace.placement(queue, requester, &mut rng);
        let track = Track::new("nuevo", "nuevo");
        queue.insert_at(QueuedTrack::new(track, requester), index).unwrap();
        index
    }

    /// The new track must follow at least one track of someone else since the
    /// requester's previous upcoming track.
    fn spaced_fairly(queue: &MusicQueue, index: usize, requester: UserId) -> bool {
        let cursor = queue.cursor().unwrap();
        let before = &queue.items()[cursor + 1..index];
        match before.iter().rposition(|item| item.requested_by == requester) {
            Some(last_own) => before[last_own + 1..]
                .iter()
                .any(|item| item.requested_by != requester),
            None => true,
        }
    }

    #[test]
    fn repeat_policy_covers_all_modes() {
        assert_eq!(RepeatPolicy::decide(RepeatMode::One, 2, 3), Advance::Replay);
        assert_eq!(RepeatPolicy::decide(RepeatMode::All, 2, 3), Advance::Wrap);
        assert_eq!(RepeatPolicy::decide(RepeatMode::All, 0, 3), Advance::Next(1));
        assert_eq!(RepeatPolicy::decide(RepeatMode::None, 2, 3), Advance::Halt);
        assert_eq!(RepeatPolicy::decide(RepeatMode::None, 1, 3), Advance::Next(2));
        assert_eq!(Advance::Wrap.target(2), Some(0));
        assert_eq!(Advance::Halt.target(2), None);
    }

    #[test]
    fn fifo_lifo_and_random_stay_after_cursor() {
        let mut queue = queue_of(&[A, B, A, B, A]);
        queue.set_position(1).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        assert_eq!(EnqueueMode::Fifo.placement(&queue, A, &mut rng), 5);
        assert_eq!(EnqueueMode::Lifo.placement(&queue, A, &mut rng), 2);
        for _ in 0..100 {
            let index = EnqueueMode::Random.placement(&queue, A, &mut rng);
            assert!((2..=5).contains(&index), "índice fuera de rango: {index}");
        }
    }

    #[test]
    fn empty_queue_always_receives_at_zero() {
        let queue = MusicQueue::new(10);
        let mut rng = StdRng::seed_from_u64(1);
        for mode in [EnqueueMode::Fifo, EnqueueMode::Lifo, EnqueueMode::Random, EnqueueMode::Interlace] {
            assert_eq!(mode.placement(&queue, A, &mut rng), 0);
        }
    }

    #[test]
    fn interlace_with_nothing_upcoming_behaves_like_lifo() {
        let mut queue = queue_of(&[A, B, A]);
        queue.set_position(2).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(EnqueueMode::Interlace.placement(&queue, C, &mut rng), 3);
    }

    #[test]
    fn interlace_two_requesters_length_four() {
        let mut queue = queue_of(&[A, B, A, B]);
        let index = interlace(&mut queue, A);
        assert_eq!(index, 4);
        assert!(spaced_fairly(&queue, index, A));
        assert_eq!(requesters(&queue), vec![A, B, A, B, A]);
    }

    #[test]
    fn interlace_two_requesters_length_eight() {
        let mut queue = queue_of(&[A, B, A, B, A, B, A, B]);
        let index = interlace(&mut queue, A);
        assert_eq!(index, 8);
        assert!(spaced_fairly(&queue, index, A));
    }

    #[test]
    fn interlace_three_requesters_length_four() {
        let mut queue = queue_of(&[Z, A, A, A]);
        let index = interlace(&mut queue, B);
        assert_eq!(index, 2);
        assert_eq!(requesters(&queue), vec![Z, A, B, A, A]);

        let index = interlace(&mut queue, B);
        assert_eq!(index, 4);
        assert!(spaced_fairly(&queue, index, B));
        assert_eq!(requesters(&queue), vec![Z, A, B, A, B, A]);
    }

    #[test]
    fn interlace_three_requesters_length_eight() {
        let mut queue = queue_of(&[Z, A, B, A, B, A, B, A]);
        let index = interlace(&mut queue, C);
        assert_eq!(index, 3);
        assert_eq!(requesters(&queue), vec![Z, A, B, C, A, B, A, B, A]);

        let index = interlace(&mut queue, C);
        assert_eq!(index, 6);
        assert!(spaced_fairly(&queue, index, C));
        assert_eq!(requesters(&queue), vec![Z, A, B, C, A, B, C, A, B, A]);

        let index = interlace(&mut queue, A);
        assert!(spaced_fairly(&queue, index, A));
    }

    #[test]
    fn interlace_keeps_a_requesters_own_order() {
        let mut queue = queue_of(&[Z, A, A, A, B]);
        let index = interlace(&mut queue, B);
        assert_eq!(index, 5);
    }

    #[test]
    fn modes_parse_from_config_strings() {
        assert_eq!("Interlace".parse::<EnqueueMode>(), Ok(EnqueueMode::Interlace));
        assert_eq!("all".parse::<RepeatMode>(), Ok(RepeatMode::All));
        assert!("sometimes".parse::<RepeatMode>().is_err());
    }
}
