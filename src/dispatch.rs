//! Contact dispatch: turns sensor contacts into register writes and spawn requests
//!
//! Sensors are built as collision-transparent colliders, so the physics
//! engine reports their contacts without resolving them. The table below then
//! decides what, if anything, a contact means for the process.
//!
//! | Pair                                  | On contact                        | On separation |
//! |---------------------------------------|-----------------------------------|---------------|
//! | limit-switch × bottle-bottom          | LIMIT_SWITCH=1 LEVEL_SENSOR=0 NOZZLE=1 | -        |
//! | level-sensor × liquid-droplet         | LIMIT_SWITCH=0 LEVEL_SENSOR=1 NOZZLE=0 | -        |
//! | bottle-inlet-sensor × bottle-bottom   | -                                 | spawn bottle  |
//! | any other pair involving a sensor     | -                                 | -             |
//!
//! Writes are unconditional overwrites, so redelivering a contact leaves the
//! registers exactly as a single delivery would.

use std::fmt;

use crate::entity::{CollisionType, SensorKind};
use crate::registers::{Tag, Word};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactPhase {
    Began,
    Separated,
}

/// A contact reported by the physics step, tagged with both collision types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactEvent {
    pub first: CollisionType,
    pub second: CollisionType,
    pub phase: ContactPhase,
}

impl ContactEvent {
    pub fn began(first: CollisionType, second: CollisionType) -> Self {
        Self {
            first,
            second,
            phase: ContactPhase::Began,
        }
    }

    pub fn separated(first: CollisionType, second: CollisionType) -> Self {
        Self {
            first,
            second,
            phase: ContactPhase::Separated,
        }
    }
}

impl fmt::Display for ContactEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            ContactPhase::Began => "began",
            ContactPhase::Separated => "separated",
        };
        write!(f, "{} × {} {}", self.first, self.second, phase)
    }
}

/// What a contact does to the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reaction {
    Ignore,
    /// A bottle reached the fill position: open the nozzle
    BottleInPlace,
    /// Liquid reached the level sensor: close the nozzle, release the bottle
    LevelReached,
    /// The previous bottle cleared the inlet
    SpawnBottle,
}

const BOTTLE_IN_PLACE: &[(Tag, Word)] = &[
    (Tag::LimitSwitch, 1),
    (Tag::LevelSensor, 0),
    (Tag::Nozzle, 1),
];

const LEVEL_REACHED: &[(Tag, Word)] = &[
    (Tag::LimitSwitch, 0),
    (Tag::LevelSensor, 1),
    (Tag::Nozzle, 0),
];

impl Reaction {
    /// Register overwrites in the order they are applied
    pub fn register_writes(self) -> &'static [(Tag, Word)] {
        match self {
            Reaction::BottleInPlace => BOTTLE_IN_PLACE,
            Reaction::LevelReached => LEVEL_REACHED,
            Reaction::Ignore | Reaction::SpawnBottle => &[],
        }
    }
}

/// Reactions of one unordered collision-type pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub on_contact: Reaction,
    pub on_separation: Reaction,
}

impl Rule {
    pub const IGNORE: Rule = Rule {
        on_contact: Reaction::Ignore,
        on_separation: Reaction::Ignore,
    };

    const fn contact(reaction: Reaction) -> Rule {
        Rule {
            on_contact: reaction,
            on_separation: Reaction::Ignore,
        }
    }

    const fn separation(reaction: Reaction) -> Rule {
        Rule {
            on_contact: Reaction::Ignore,
            on_separation: reaction,
        }
    }

    pub fn reaction(&self, phase: ContactPhase) -> Reaction {
        match phase {
            ContactPhase::Began => self.on_contact,
            ContactPhase::Separated => self.on_separation,
        }
    }
}

/// Look up the rule for a pair, in either order
///
/// Returns `None` when neither side is a sensor: such contacts are ordinary
/// physical collisions and never reach the process.
pub fn rule_for(a: CollisionType, b: CollisionType) -> Option<Rule> {
    let (sensor, other) = match (a.sensor_kind(), b.sensor_kind()) {
        (Some(sensor), _) => (sensor, b),
        (None, Some(sensor)) => (sensor, a),
        (None, None) => return None,
    };
    Some(sensor_rule(sensor, other))
}

fn sensor_rule(sensor: SensorKind, other: CollisionType) -> Rule {
    use CollisionType::*;

    match (sensor, other) {
        (SensorKind::LimitSwitch, BottleBottom) => Rule::contact(Reaction::BottleInPlace),
        (SensorKind::LimitSwitch, Ground | BottleSide) => Rule::IGNORE,
        (
            SensorKind::LimitSwitch,
            LiquidDroplet | ActuatorVisual | LimitSwitch | LevelSensor | BottleInletSensor,
        ) => Rule::IGNORE,

        (SensorKind::LevelSensor, LiquidDroplet) => Rule::contact(Reaction::LevelReached),
        (SensorKind::LevelSensor, Ground | BottleSide) => Rule::IGNORE,
        (
            SensorKind::LevelSensor,
            BottleBottom | ActuatorVisual | LimitSwitch | LevelSensor | BottleInletSensor,
        ) => Rule::IGNORE,

        (SensorKind::BottleInlet, BottleBottom) => Rule::separation(Reaction::SpawnBottle),
        (SensorKind::BottleInlet, BottleSide) => Rule::IGNORE,
        (
            SensorKind::BottleInlet,
            Ground | LiquidDroplet | ActuatorVisual | LimitSwitch | LevelSensor | BottleInletSensor,
        ) => Rule::IGNORE,
    }
}

/// Reaction to a single event
pub fn reaction_for(event: &ContactEvent) -> Reaction {
    rule_for(event.first, event.second)
        .map(|rule| rule.reaction(event.phase))
        .unwrap_or(Reaction::Ignore)
}

/// Receiver of the effects of a dispatched contact
pub trait EventSink {
    fn write_register(&mut self, tag: Tag, value: Word);
    fn request_bottle(&mut self);
}

/// Apply the effects of `event` to `sink` and return the reaction taken
pub fn dispatch(event: &ContactEvent, sink: &mut impl EventSink) -> Reaction {
    let reaction = reaction_for(event);
    match reaction {
        Reaction::Ignore => {
            log::trace!("Contact {event} ignored");
        }
        Reaction::SpawnBottle => {
            log::debug!("Contact {event}: requesting a new bottle");
            sink.request_bottle();
        }
        Reaction::BottleInPlace | Reaction::LevelReached => {
            log::debug!("Contact {event}: {reaction:?}");
            for &(tag, value) in reaction.register_writes() {
                sink.write_register(tag, value);
            }
        }
    }
    reaction
}
