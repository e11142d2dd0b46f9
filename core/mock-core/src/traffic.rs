//! Traffic object model: the requests the engine receives and the responses
//! it sends back or records.

use crate::config::{RcConfig, COMMAND_LINE_SECTION, FUNCTIONS_SECTION};
use crate::transport::is_peer_gone;
use capturemock_protocol::{
    repr, CommandKillEnvelope, CommandLineEnvelope, CommandReply, Envelope, FunctionCallEnvelope,
    CMD_SEP,
};
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Into the SUT boundary (`<-`).
    Request,
    /// Out of the SUT boundary (`->`).
    Response,
}

impl Direction {
    pub fn marker(self) -> &'static str {
        match self {
            Direction::Request => "<-",
            Direction::Response => "->",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "<-" => Some(Direction::Request),
            "->" => Some(Direction::Response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestTag {
    CommandLine,
    CommandKill,
    ServerState,
    ClientSocket,
    FunctionCall,
}

const REQUEST_TAGS: &[(&str, RequestTag)] = &[
    ("CMD", RequestTag::CommandLine),
    ("KIL", RequestTag::CommandKill),
    ("SRV", RequestTag::ServerState),
    ("CLI", RequestTag::ClientSocket),
    ("FNC", RequestTag::FunctionCall),
];

impl RequestTag {
    pub fn tag(self) -> &'static str {
        REQUEST_TAGS
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(tag, _)| *tag)
            .unwrap_or("???")
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        REQUEST_TAGS
            .iter()
            .find(|(name, _)| *name == tag)
            .map(|(_, kind)| *kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Stdout,
    Stderr,
    Exit,
    Server,
    Return,
}

const RESPONSE_TAGS: &[(&str, ResponseKind)] = &[
    ("OUT", ResponseKind::Stdout),
    ("ERR", ResponseKind::Stderr),
    ("EXC", ResponseKind::Exit),
    ("SRV", ResponseKind::Server),
    ("RET", ResponseKind::Return),
];

impl ResponseKind {
    pub fn tag(self) -> &'static str {
        RESPONSE_TAGS
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(tag, _)| *tag)
            .unwrap_or("???")
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        RESPONSE_TAGS
            .iter()
            .find(|(name, _)| *name == tag)
            .map(|(_, kind)| *kind)
    }
}

/// One response traffic item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub kind: ResponseKind,
    pub text: String,
}

impl Response {
    pub fn new(kind: ResponseKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::Response
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.tag()
    }

    pub fn description(&self) -> String {
        format!("{}{}:{}", Direction::Response.marker(), self.type_tag(), self.text)
    }

    /// Empty responses carry nothing worth recording.
    pub fn has_info(&self) -> bool {
        !self.text.is_empty()
    }

    /// The bytes this response contributes to the reply.
    pub fn wire_form(&self) -> String {
        match self.kind {
            ResponseKind::Stdout | ResponseKind::Stderr => format!("{}{}", self.text, CMD_SEP),
            ResponseKind::Exit | ResponseKind::Server | ResponseKind::Return => self.text.clone(),
        }
    }

    pub fn forward<W: Write>(&self, sink: &mut ResponseSink<W>) -> std::io::Result<()> {
        sink.write(&self.wire_form())
    }
}

/// Builds the OUT/ERR/EXC responses for a command result.
pub fn command_responses(reply: &CommandReply) -> Vec<Response> {
    vec![
        Response::new(ResponseKind::Stdout, reply.stdout.clone()),
        Response::new(ResponseKind::Stderr, reply.stderr.clone()),
        Response::new(ResponseKind::Exit, reply.exit_code.to_string()),
    ]
}

/// Where responses are written. A missing writer or a peer that has gone
/// away swallows writes; other I/O errors are returned.
pub struct ResponseSink<W: Write> {
    writer: Option<W>,
    peer_gone: bool,
}

impl<W: Write> ResponseSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            peer_gone: false,
        }
    }

    pub fn detached() -> Self {
        Self {
            writer: None,
            peer_gone: false,
        }
    }

    pub fn peer_gone(&self) -> bool {
        self.peer_gone
    }

    pub fn write(&mut self, text: &str) -> std::io::Result<()> {
        if self.peer_gone || text.is_empty() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        match writer.write_all(text.as_bytes()).and_then(|()| writer.flush()) {
            Ok(()) => Ok(()),
            Err(err) if is_peer_gone(&err) => {
                tracing::debug!(error = %err, "Client went away; dropping response");
                self.peer_gone = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub envelope: CommandLineEnvelope,
    /// Basename of the program.
    pub name: String,
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub envelope: FunctionCallEnvelope,
    text: String,
}

/// Requests as the engine sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CommandLine(CommandLine),
    CommandKill(CommandKillEnvelope),
    ServerState(String),
    ClientSocket(String),
    FunctionCall(FunctionCall),
}

impl Request {
    /// Classifies an envelope. `TERMINATE_SERVER` is a control message and
    /// yields `None`.
    pub fn from_envelope(envelope: Envelope, config: &RcConfig) -> Option<Self> {
        match envelope {
            Envelope::CommandLine(envelope) => Some(Request::CommandLine(CommandLine::new(
                envelope, config,
            ))),
            Envelope::CommandKill(envelope) => Some(Request::CommandKill(envelope)),
            Envelope::ServerState(state) => Some(Request::ServerState(state)),
            Envelope::FunctionCall(envelope) => {
                Some(Request::FunctionCall(FunctionCall::new(envelope)))
            }
            Envelope::Raw(text) => Some(Request::ClientSocket(text)),
            Envelope::Terminate => None,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::Request
    }

    pub fn tag(&self) -> RequestTag {
        match self {
            Request::CommandLine(_) => RequestTag::CommandLine,
            Request::CommandKill(_) => RequestTag::CommandKill,
            Request::ServerState(_) => RequestTag::ServerState,
            Request::ClientSocket(_) => RequestTag::ClientSocket,
            Request::FunctionCall(_) => RequestTag::FunctionCall,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.tag().tag()
    }

    pub fn text(&self) -> String {
        match self {
            Request::CommandLine(command) => command.text.clone(),
            Request::CommandKill(kill) => kill.signal.to_string(),
            Request::ServerState(state) => state.clone(),
            Request::ClientSocket(text) => text.clone(),
            Request::FunctionCall(call) => call.text.clone(),
        }
    }

    pub fn description(&self) -> String {
        format!("{}{}:{}", Direction::Request.marker(), self.type_tag(), self.text())
    }

    /// Kills are never recorded; everything else needs non-empty text.
    pub fn has_info(&self) -> bool {
        match self {
            Request::CommandKill(_) => false,
            _ => !self.text().is_empty(),
        }
    }

    /// rc sections consulted for per-intercept options, most specific first.
    pub fn rc_sections(&self) -> Vec<String> {
        match self {
            Request::CommandLine(command) => {
                vec![command.name.clone(), COMMAND_LINE_SECTION.to_string()]
            }
            Request::FunctionCall(call) => {
                let mut sections: Vec<String> = dotted_prefixes(&call.envelope.function)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                sections.push(FUNCTIONS_SECTION.to_string());
                sections
            }
            _ => Vec::new(),
        }
    }

    /// Name used by replay-item filters, for intercept kinds that have one.
    pub fn item_name(&self) -> Option<&str> {
        match self {
            Request::CommandLine(command) => Some(&command.name),
            Request::FunctionCall(call) => Some(&call.envelope.function),
            _ => None,
        }
    }

    pub fn enquiry_only(&self, config: &RcConfig) -> bool {
        let sections = self.rc_sections();
        if sections.is_empty() {
            return false;
        }
        let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
        config
            .get_boolean("enquiry_only", &sections, false)
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "Ignoring invalid enquiry_only option");
                false
            })
    }

    /// Normalizes replayed responses into the shape the client expects.
    /// Command lines always get OUT, ERR, EXC in that order.
    pub fn filter_replay(&self, responses: Vec<Response>) -> Vec<Response> {
        match self {
            Request::CommandLine(_) => filter_command_replay(responses),
            _ => responses,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl CommandLine {
    pub fn new(envelope: CommandLineEnvelope, config: &RcConfig) -> Self {
        let name = envelope
            .argv
            .first()
            .map(|program| program_name(program).to_string())
            .unwrap_or_default();
        let mut args = envelope.argv.clone();
        if let Some(program) = args.first_mut() {
            *program = name.clone();
        }

        let sections = [name.as_str(), COMMAND_LINE_SECTION];
        let env_prefix: Vec<String> = config
            .get_list("environment", &sections)
            .into_iter()
            .filter_map(|var| {
                envelope
                    .environ
                    .get(&var)
                    .map(|value| repr::render_str(&format!("{}={}", var, value)))
            })
            .collect();

        let mut text = String::new();
        if !env_prefix.is_empty() {
            text.push_str("env ");
            text.push_str(&env_prefix.join(" "));
            text.push(' ');
        }
        text.push_str(&repr::render_list(&args));

        Self {
            envelope,
            name,
            text,
        }
    }
}

impl FunctionCall {
    pub fn new(envelope: FunctionCallEnvelope) -> Self {
        let text = format!("{}({})", envelope.function, strip_brackets(envelope.args.trim()));
        Self { envelope, text }
    }

    /// Renders a function call the way it appears in scripts.
    pub fn render(function: &str, args_json: &str) -> String {
        format!("{}({})", function, strip_brackets(args_json.trim()))
    }
}

/// Basename of a program path, accepting either separator.
pub fn program_name(program: &str) -> &str {
    program.rsplit(['/', '\\']).next().unwrap_or(program)
}

fn strip_brackets(args: &str) -> &str {
    args.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(args)
}

/// `a.b.c` yields `a.b.c`, `a.b`, `a`.
fn dotted_prefixes(name: &str) -> Vec<&str> {
    let mut prefixes = vec![name];
    let mut rest = name;
    while let Some((head, _)) = rest.rsplit_once('.') {
        prefixes.push(head);
        rest = head;
    }
    prefixes
}

/// Picks OUT, ERR and EXC by tag. Repeated OUT or ERR sections are joined,
/// the first EXC wins, and anything else in the block is dropped.
fn filter_command_replay(responses: Vec<Response>) -> Vec<Response> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit = None;
    for response in responses {
        match response.kind {
            ResponseKind::Stdout => stdout.push_str(&response.text),
            ResponseKind::Stderr => stderr.push_str(&response.text),
            ResponseKind::Exit if exit.is_none() => exit = Some(response.text),
            kind => tracing::debug!(tag = kind.tag(), "Dropping stray response in command replay"),
        }
    }
    vec![
        Response::new(ResponseKind::Stdout, stdout),
        Response::new(ResponseKind::Stderr, stderr),
        Response::new(ResponseKind::Exit, exit.unwrap_or_else(|| "0".to_string())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn command(argv: &[&str]) -> CommandLineEnvelope {
        CommandLineEnvelope {
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            environ: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            cwd: "/tmp".to_string(),
            pid: 1234,
        }
    }

    #[test]
    fn command_text_uses_program_basename() {
        let request = Request::from_envelope(
            Envelope::CommandLine(command(&["/usr/bin/echo", "hi"])),
            &RcConfig::empty(),
        )
        .unwrap();
        assert_eq!(request.description(), "<-CMD:['echo','hi']");
        assert_eq!(request.item_name(), Some("echo"));
    }

    #[test]
    fn configured_environment_prefixes_command_text() {
        let config =
            RcConfig::parse("[ls]\nenvironment = LANG, MISSING\n", Path::new("rc")).unwrap();
        let request =
            Request::from_envelope(Envelope::CommandLine(command(&["ls"])), &config).unwrap();
        assert_eq!(request.text(), "env 'LANG=C' ['ls']");
    }

    #[test]
    fn kills_are_never_recordable() {
        let kill = Request::CommandKill(CommandKillEnvelope {
            signal: 15,
            pid: 1234,
        });
        assert!(!kill.has_info());
        assert!(!Request::ServerState(String::new()).has_info());
        assert!(Request::ServerState("ready".to_string()).has_info());
    }

    #[test]
    fn terminate_is_not_a_request() {
        assert!(Request::from_envelope(Envelope::Terminate, &RcConfig::empty()).is_none());
    }

    #[test]
    fn function_calls_render_arguments_in_parentheses() {
        let call = FunctionCall::new(FunctionCallEnvelope {
            function: "clock.now".to_string(),
            args: "[1, \"utc\"]".to_string(),
        });
        let request = Request::FunctionCall(call);
        assert_eq!(request.text(), "clock.now(1, \"utc\")");
        assert_eq!(request.rc_sections(), vec!["clock.now", "clock", "functions"]);
    }

    #[test]
    fn enquiry_only_reads_intercept_sections() {
        let config = RcConfig::parse("[git]\nenquiry_only = true\n", Path::new("rc")).unwrap();
        let git = Request::from_envelope(Envelope::CommandLine(command(&["git", "status"])), &config)
            .unwrap();
        let ls = Request::from_envelope(Envelope::CommandLine(command(&["ls"])), &config).unwrap();
        assert!(git.enquiry_only(&config));
        assert!(!ls.enquiry_only(&config));
    }

    #[test]
    fn command_replay_picks_responses_by_tag() {
        let request =
            Request::from_envelope(Envelope::CommandLine(command(&["ls"])), &RcConfig::empty())
                .unwrap();
        let filtered = request.filter_replay(vec![
            Response::new(ResponseKind::Exit, "2"),
            Response::new(ResponseKind::Stderr, "warn\n"),
            Response::new(ResponseKind::Stdout, "a\n"),
            Response::new(ResponseKind::Stdout, "b\n"),
            Response::new(ResponseKind::Exit, "7"),
        ]);
        assert_eq!(
            filtered,
            vec![
                Response::new(ResponseKind::Stdout, "a\nb\n"),
                Response::new(ResponseKind::Stderr, "warn\n"),
                Response::new(ResponseKind::Exit, "2"),
            ]
        );
        let wire: String = filtered.iter().map(Response::wire_form).collect();
        assert_eq!(wire, "a\nb\n|TT_CMD_SEP|warn\n|TT_CMD_SEP|2");
    }

    #[test]
    fn command_replay_fills_missing_responses() {
        let request =
            Request::from_envelope(Envelope::CommandLine(command(&["ls"])), &RcConfig::empty())
                .unwrap();
        let filled = request.filter_replay(vec![Response::new(ResponseKind::Stderr, "oops\n")]);
        assert_eq!(
            filled,
            vec![
                Response::new(ResponseKind::Stdout, ""),
                Response::new(ResponseKind::Stderr, "oops\n"),
                Response::new(ResponseKind::Exit, "0"),
            ]
        );
    }

    #[test]
    fn command_responses_forward_as_reply_triple() {
        let reply = CommandReply {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let mut sink = ResponseSink::new(Vec::new());
        for response in command_responses(&reply) {
            response.forward(&mut sink).unwrap();
        }
        let written = sink.into_inner().unwrap();
        assert_eq!(String::from_utf8(written).unwrap(), "hi\n|TT_CMD_SEP||TT_CMD_SEP|0");
    }

    struct GoneWriter;

    impl Write for GoneWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn sink_swallows_dead_peer_but_not_other_errors() {
        let mut gone = ResponseSink::new(GoneWriter);
        assert!(gone.write("data").is_ok());
        assert!(gone.peer_gone());
        assert!(gone.write("more").is_ok());

        let mut detached: ResponseSink<Vec<u8>> = ResponseSink::detached();
        assert!(detached.write("data").is_ok());

        let mut full = ResponseSink::new(FullDisk);
        assert!(full.write("data").is_err());
    }

    #[test]
    fn tags_dispatch_both_ways() {
        for tag in ["OUT", "ERR", "EXC", "SRV", "RET"] {
            assert_eq!(ResponseKind::from_tag(tag).unwrap().tag(), tag);
        }
        for tag in ["CMD", "KIL", "SRV", "CLI", "FNC"] {
            assert_eq!(RequestTag::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(ResponseKind::from_tag("PYT").is_none());
    }
}
