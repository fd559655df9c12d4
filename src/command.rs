//! Commands and deterministic command sequences.
//!
//! A `SequenceSpec` is a list of `Step`s (`incr:a*10000`, `decr:a*10000`, ...)
//! that `generate` expands into a `CommandSequence`. Generation is pure: the
//! same spec always yields the same sequence, which is what lets the
//! benchmark and the comparator replay identical traffic against every
//! endpoint.

use crate::protocols::resp::parser::encode_request;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Most commands a single sequence may expand to.
pub const MAX_SEQUENCE_LEN: usize = 100_000_000;

/// One request: a command name plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new<N, I, A>(name: N, args: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Command {
            name: name.into().to_uppercase(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn ping() -> Self {
        Command::new("PING", Vec::<Bytes>::new())
    }

    pub fn get(key: &str) -> Self {
        Command::new("GET", [key.to_string()])
    }

    #[cfg(test)]
    pub fn set(key: &str, value: &str) -> Self {
        Command::new("SET", [key.to_string(), value.to_string()])
    }

    #[cfg(test)]
    pub fn incr(key: &str) -> Self {
        Command::new("INCR", [key.to_string()])
    }

    #[cfg(test)]
    pub fn decr(key: &str) -> Self {
        Command::new("DECR", [key.to_string()])
    }

    /// `DEL key [key ...]`
    pub fn del<S: AsRef<str>>(keys: &[S]) -> Self {
        Command::new("DEL", keys.iter().map(|k| k.as_ref().to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Append the RESP encoding of this command to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        encode_request(&self.name, &self.args, buf);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// Operation kinds a sequence step may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Ping,
    Echo,
    Get,
    Set,
    Del,
    Incr,
    Decr,
    IncrBy,
    DecrBy,
    Lpush,
    Rpush,
    Lpop,
    Rpop,
    Llen,
    FlushAll,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Ping => "ping",
            Op::Echo => "echo",
            Op::Get => "get",
            Op::Set => "set",
            Op::Del => "del",
            Op::Incr => "incr",
            Op::Decr => "decr",
            Op::IncrBy => "incrby",
            Op::DecrBy => "decrby",
            Op::Lpush => "lpush",
            Op::Rpush => "rpush",
            Op::Lpop => "lpop",
            Op::Rpop => "rpop",
            Op::Llen => "llen",
            Op::FlushAll => "flushall",
        }
    }

    fn takes_key(self) -> bool {
        !matches!(self, Op::Ping | Op::Echo | Op::FlushAll)
    }

    fn takes_arg(self) -> bool {
        matches!(
            self,
            Op::Echo | Op::Set | Op::IncrBy | Op::DecrBy | Op::Lpush | Op::Rpush
        )
    }
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.to_ascii_lowercase().as_str() {
            "ping" => Op::Ping,
            "echo" => Op::Echo,
            "get" => Op::Get,
            "set" => Op::Set,
            "del" => Op::Del,
            "incr" => Op::Incr,
            "decr" => Op::Decr,
            "incrby" => Op::IncrBy,
            "decrby" => Op::DecrBy,
            "lpush" => Op::Lpush,
            "rpush" => Op::Rpush,
            "lpop" => Op::Lpop,
            "rpop" => Op::Rpop,
            "llen" => Op::Llen,
            "flushall" => Op::FlushAll,
            other => return Err(format!("unknown operation '{other}'")),
        };
        Ok(op)
    }
}

/// `count` consecutive copies of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    op: Op,
    key: Option<String>,
    arg: Option<String>,
    count: usize,
}

impl Step {
    /// Build a validated step. Keys and arguments must be present exactly when
    /// the operation takes them.
    pub fn new(
        op: Op,
        key: Option<String>,
        arg: Option<String>,
        count: usize,
    ) -> Result<Self, String> {
        let name = op.name();
        if count == 0 {
            return Err(format!("{name}: count must be at least 1"));
        }
        if count > MAX_SEQUENCE_LEN {
            return Err(format!(
                "{name}: count {count} exceeds the limit of {MAX_SEQUENCE_LEN}"
            ));
        }
        match (op.takes_key(), &key) {
            (true, None) => return Err(format!("{name}: missing key")),
            (true, Some(k)) if k.is_empty() => return Err(format!("{name}: empty key")),
            (false, Some(_)) => return Err(format!("{name}: takes no key")),
            _ => {}
        }
        match (op.takes_arg(), &arg) {
            (true, None) => return Err(format!("{name}: missing argument")),
            (false, Some(_)) => return Err(format!("{name}: takes no argument")),
            _ => {}
        }
        if let (Op::IncrBy | Op::DecrBy, Some(a)) = (op, &arg) {
            a.parse::<i64>()
                .map_err(|_| format!("{name}: '{a}' is not an integer"))?;
        }
        Ok(Step {
            op,
            key,
            arg,
            count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn prefixed_key(&self, prefix: Option<&str>) -> Option<String> {
        self.key.as_ref().map(|k| match prefix {
            Some(p) => format!("{p}{k}"),
            None => k.clone(),
        })
    }

    fn command(&self, prefix: Option<&str>) -> Command {
        let mut args: Vec<String> = Vec::with_capacity(2);
        args.extend(self.prefixed_key(prefix));
        args.extend(self.arg.clone());
        Command::new(self.op.name(), args)
    }
}

/// Splits a trailing `*<digits>` count off a step.
fn split_count(s: &str) -> Option<(&str, &str)> {
    s.rsplit_once('*')
        .filter(|(_, n)| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Parses `op[:key][:arg][*count]`. Operations without a key take the
/// argument directly (`echo:hello`); the argument of keyed operations may
/// itself contain colons. Only a trailing `*<digits>` is a count, so
/// `set:k:a*b` sets `a*b`; write `echo:2*3*1` to send `2*3` once.
impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, count) = match split_count(s) {
            Some((body, n)) => {
                let count = n
                    .parse::<usize>()
                    .map_err(|_| format!("invalid count '{n}' in step '{s}'"))?;
                (body, count)
            }
            None => (s, 1),
        };

        let (op, rest) = match body.split_once(':') {
            Some((op, rest)) => (op.parse::<Op>()?, Some(rest)),
            None => (body.parse::<Op>()?, None),
        };

        let (key, arg) = match (op.takes_key(), rest) {
            (_, None) => (None, None),
            (true, Some(rest)) => match rest.split_once(':') {
                Some((k, a)) => (Some(k.to_string()), Some(a.to_string())),
                None => (Some(rest.to_string()), None),
            },
            (false, Some(rest)) => (None, Some(rest.to_string())),
        };

        Step::new(op, key, arg, count)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.name())?;
        let mut last = self.op.name();
        for part in self.key.iter().chain(self.arg.iter()) {
            write!(f, ":{part}")?;
            last = part.as_str();
        }
        if self.count != 1 || split_count(last).is_some() {
            write!(f, "*{}", self.count)?;
        }
        Ok(())
    }
}

/// Shape of a sequence: ordered steps plus an optional key namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSpec {
    pub key_prefix: Option<String>,
    pub steps: Vec<Step>,
}

impl SequenceSpec {
    /// `count` increments followed by `count` decrements on `key`.
    pub fn incr_then_decr(key: &str, count: usize) -> Result<Self, String> {
        Ok(SequenceSpec {
            key_prefix: None,
            steps: vec![
                Step::new(Op::Incr, Some(key.to_string()), None, count)?,
                Step::new(Op::Decr, Some(key.to_string()), None, count)?,
            ],
        })
    }

    /// Number of commands the spec expands to, checked against
    /// `MAX_SEQUENCE_LEN`.
    pub fn total_commands(&self) -> Result<usize, String> {
        self.steps
            .iter()
            .try_fold(0usize, |total, step| total.checked_add(step.count()))
            .filter(|&total| total <= MAX_SEQUENCE_LEN)
            .ok_or_else(|| format!("sequence exceeds the limit of {MAX_SEQUENCE_LEN} commands"))
    }

    /// Human-readable descriptor, e.g. `incr:a*10000, decr:a*10000`.
    pub fn describe(&self) -> String {
        let steps: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
        match &self.key_prefix {
            Some(p) => format!("[{p}] {}", steps.join(", ")),
            None => steps.join(", "),
        }
    }
}

/// The ordered commands of one run. Never mutated after generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    commands: Vec<Command>,
}

impl CommandSequence {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Command> {
        self.commands.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn as_slice(&self) -> &[Command] {
        &self.commands
    }

    /// Distinct keys touched by the sequence, in order of first use.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for cmd in &self.commands {
            if cmd.name() == "PING" || cmd.name() == "ECHO" || cmd.name() == "FLUSHALL" {
                continue;
            }
            if let Some(key) = cmd.args().first() {
                let key = String::from_utf8_lossy(key).into_owned();
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

impl From<Vec<Command>> for CommandSequence {
    fn from(commands: Vec<Command>) -> Self {
        CommandSequence { commands }
    }
}

/// Expand a spec into its command sequence.
pub fn generate(spec: &SequenceSpec) -> CommandSequence {
    let prefix = spec.key_prefix.as_deref();
    let total = spec.total_commands().unwrap_or(MAX_SEQUENCE_LEN);
    let mut commands = Vec::with_capacity(total);
    for step in &spec.steps {
        let command = step.command(prefix);
        commands.extend(std::iter::repeat(command).take(step.count));
    }
    CommandSequence { commands }
}
