//! The outbound half of talking to a robot.
//!
//! Whatever carries commands to the robots (HTTP in the field, an in-process
//! simulator in tests) implements [`RobotLink`]. Commands are typed here and
//! know their text wire form; the one response with structure, the listen
//! acknowledgement, is parsed here too so that every transport treats it the
//! same way.

use crate::fleet::Robot;
use nom::{
    character::complete::{char, i64, multispace0},
    combinator::{all_consuming, map},
    error::Error,
    sequence::{delimited, separated_pair},
    Finish, IResult,
};
use std::{borrow::Cow, fmt, str::FromStr};

/// Tells a robot to record both microphones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenCommand {
    /// How long to record.
    pub window_ms: u32,
    /// How long to wait before recording.
    pub delay_ms: i64,
}

/// Tells a robot to play the ranging tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakCommand {
    /// How long to play.
    pub duration_ms: u32,
    /// How long to wait before playing.
    pub delay_ms: i64,
}

/// A movement a robot can be asked to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// Drive forward this many centimeters.
    Forward(u32),
    /// Drive backward this many centimeters.
    Backward(u32),
    /// Turn in place this many degrees, clockwise positive.
    Rotate(i32),
}

impl fmt::Display for ListenCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l,{},{}", self.window_ms, self.delay_ms)
    }
}

impl fmt::Display for SpeakCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s,{},{}", self.duration_ms, self.delay_ms)
    }
}

impl fmt::Display for Motion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Motion::Forward(cm) => write!(f, "f,{}", cm),
            Motion::Backward(cm) => write!(f, "b,{}", cm),
            Motion::Rotate(deg) => write!(f, "r,{}", deg),
        }
    }
}

/// Something went wrong talking to a robot. None of these are fatal; callers
/// log them and carry on with whatever they have.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The robot could not be reached at all.
    Unreachable(String),
    /// The robot answered, but refused or failed the command.
    Rejected(String),
    /// The robot answered with something we could not read.
    Malformed(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LinkError::Unreachable(why) => Cow::from(format!("unreachable: {}", why)),
            LinkError::Rejected(why) => Cow::from(format!("rejected: {}", why)),
            LinkError::Malformed(why) => Cow::from(format!("malformed response: {}", why)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for LinkError {}

/// Delivers commands to individual robots.
///
/// Every call is a blocking request/response. Results of the listen and speak
/// commands arrive later, asynchronously, as capture reports; results of
/// motions arrive as movement reports.
pub trait RobotLink: Send + Sync {
    /// Arms the robot's microphones. Returns the raw acknowledgement text,
    /// which should parse as a [`ListenAck`].
    fn listen(&self, robot: &Robot, command: ListenCommand) -> Result<String, LinkError>;

    /// Makes the robot play the ranging tone.
    fn speak(&self, robot: &Robot, command: SpeakCommand) -> Result<(), LinkError>;

    /// Starts a movement.
    fn motion(&self, robot: &Robot, motion: Motion) -> Result<(), LinkError>;

    /// Takes a single ultrasonic reading, in centimeters.
    fn range(&self, robot: &Robot) -> Result<f64, LinkError>;
}

/// The listener's answer to a [`ListenCommand`]: when it received the
/// command and when its microphones were ready, on its own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAck {
    #[allow(missing_docs)]
    pub armed_ms: i64,
    #[allow(missing_docs)]
    pub ready_ms: i64,
}

impl ListenAck {
    /// Time the listener spent getting ready.
    pub fn setup_ms(&self) -> i64 {
        self.ready_ms - self.armed_ms
    }

    /// One-way link latency, given host timestamps taken just before sending
    /// the command and just after the acknowledgement came back.
    pub fn flight_ms(&self, sent_ms: i64, answered_ms: i64) -> i64 {
        (answered_ms - sent_ms - self.setup_ms()) / 2
    }
}

fn parse_listen_ack(s: &str) -> IResult<&str, ListenAck> {
    map(
        all_consuming(delimited(
            multispace0,
            separated_pair(i64, delimited(multispace0, char(','), multispace0), i64),
            multispace0,
        )),
        |(armed_ms, ready_ms)| ListenAck { armed_ms, ready_ms },
    )(s)
}

impl FromStr for ListenAck {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_listen_ack(s).finish() {
            Ok((_remaining, ack)) => Ok(ack),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}
