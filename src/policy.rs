use crate::detection::Detection;
use std::fmt;

/// Steering instruction understood by the motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Forward,
    Left,
    Right,
    Stop,
}

impl Command {
    pub const ALL: [Command; 4] = [
        Command::Forward,
        Command::Left,
        Command::Right,
        Command::Stop,
    ];

    /// Wire byte sent over the serial line.
    pub fn code(self) -> u8 {
        match self {
            Command::Forward => b'F',
            Command::Left => b'L',
            Command::Right => b'R',
            Command::Stop => b'S',
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            b'F' => Ok(Command::Forward),
            b'L' => Ok(Command::Left),
            b'R' => Ok(Command::Right),
            b'S' => Ok(Command::Stop),
            other => Err(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Forward => "forward",
            Command::Left => "left",
            Command::Right => "right",
            Command::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Maps one frame's detections to a single command.
///
/// Only the first detection (in detector order) of `target_class` whose confidence is
/// strictly above `confidence_threshold` is considered, even if a later one scores higher.
/// Its horizontal center is placed into one of three equal zones of the frame width;
/// a center sitting exactly on a zone boundary counts as the middle zone.
pub fn decide(
    detections: &[Detection],
    frame_width: u32,
    confidence_threshold: f32,
    target_class: i32,
) -> Command {
    let Some(target) = detections
        .iter()
        .find(|d| d.confidence > confidence_threshold && d.class_id == target_class)
    else {
        return Command::Stop;
    };

    let center_x = target.bbox.center_x();
    let thirds = i64::from(frame_width / 3);

    if center_x < thirds {
        Command::Left
    } else if center_x > 2 * thirds {
        Command::Right
    } else {
        Command::Forward
    }
}
