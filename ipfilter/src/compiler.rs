
use ipfilter_common::{Direction, Family, IPPROTO_TCP};
use tracing::debug;

use crate::{
    cidr::{Address, HostMatch},
    encode::{
        parse_host, parse_host_and_mask, parse_icmp, parse_icmp_code, parse_ipopts, parse_ports,
        parse_proto, parse_secclass, parse_tcp_flags,
    },
    error::FieldError,
    resolve::{proto_name, Resolver},
    rule::{
        with_flag_bit, Action, BlockReturn, LogLevel, LogSpec, Priority, ProtoMatch, Rule,
        RuleBody, Target,
    },
    token::Tokens,
    Error, Result, Tick,
};

const END_OF_LINE: &str = "end of line";
// ICMP port unreachable.
const DEFAULT_RETURN_CODE: u8 = 3;

/// Keywords that may follow the address part in any order.
const CLAUSES: &[&str] = &[
    "proto",
    "flags",
    "with",
    "icmp-type",
    "keep",
    "state-age",
    "pps",
    "head",
    "group",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Action,
    Direction,
    LogOptions,
    InterfaceBindings,
    TosTtl,
    Protocol,
    SourceHost,
    SourcePorts,
    DestHost,
    DestPorts,
    Extras,
    IcmpType,
    Keep,
    Group,
    Trailing,
    Done,
}

/// Compiles rule text into [Rule]s.
pub struct Compiler<'r> {
    resolver: &'r dyn Resolver,
    family: Family,
}

impl<'r> Compiler<'r> {
    pub fn new(resolver: &'r dyn Resolver) -> Self {
        Self {
            resolver,
            family: Family::V4,
        }
    }

    /// Family used when neither a `family` keyword nor an address literal decides it.
    pub fn with_family(self, family: Family) -> Self {
        Self { family, ..self }
    }

    /// Compiles one line. Blank and comment-only lines yield `None`.
    pub fn compile_line(&self, line: usize, text: &str) -> Result<Option<Rule>> {
        let tokens = Tokens::scan(text);
        if tokens.is_empty() {
            return Ok(None);
        }
        let body = Builder::new(line, tokens, self.resolver, self.family).run()?;
        Ok(Some(Rule::new(line, body)))
    }

    /// Compiles every line of `text`. A failing line is reported and skipped,
    /// the lines around it still compile.
    pub fn compile_str(&self, text: &str) -> (Vec<Rule>, Vec<Error>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for (i, line) in text.lines().enumerate() {
            match self.compile_line(i + 1, line) {
                Ok(Some(rule)) => rules.push(rule),
                Ok(None) => {}
                Err(e) => {
                    debug!("skipping rule: {e}");
                    errors.push(e);
                }
            }
        }
        (rules, errors)
    }
}

struct Builder<'t, 'r> {
    line: usize,
    tokens: Tokens<'t>,
    resolver: &'r dyn Resolver,
    default_family: Family,
    family: Option<Family>,
    body: RuleBody,
    proto_text: Option<String>,
    has_flags: bool,
    has_icmp: bool,
}

impl<'t, 'r> Builder<'t, 'r> {
    fn new(line: usize, tokens: Tokens<'t>, resolver: &'r dyn Resolver, family: Family) -> Self {
        Self {
            line,
            tokens,
            resolver,
            default_family: family,
            family: None,
            body: RuleBody::new(family, Direction::In, Action::Pass),
            proto_text: None,
            has_flags: false,
            has_icmp: false,
        }
    }

    fn syntax(&self, token: &str) -> Error {
        Error::Syntax {
            line: self.line,
            token: token.to_string(),
        }
    }

    fn semantic(&self, reason: impl Into<String>) -> Error {
        Error::Semantic {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn mismatch(&self, reason: impl Into<String>) -> Error {
        Error::ProtocolMismatch {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn field<T>(&self, res: std::result::Result<T, FieldError>) -> Result<T> {
        res.map_err(|e| e.at(self.line))
    }

    fn expect(&mut self) -> Result<&'t str> {
        match self.tokens.next() {
            Some(t) => Ok(t),
            None => Err(self.syntax(END_OF_LINE)),
        }
    }

    fn hint_family(&self) -> Family {
        self.family.unwrap_or(self.default_family)
    }

    fn run(mut self) -> Result<RuleBody> {
        let mut state = State::Action;
        while state != State::Done {
            state = match state {
                State::Action => self.action()?,
                State::Direction => self.direction()?,
                State::LogOptions => self.log_options()?,
                State::InterfaceBindings => self.interface_bindings()?,
                State::TosTtl => self.tos_ttl()?,
                State::Protocol => self.protocol()?,
                State::SourceHost => self.source_host()?,
                State::SourcePorts => self.ports(State::DestHost)?,
                State::DestHost => self.dest_host()?,
                State::DestPorts => self.ports(State::Extras)?,
                State::Extras => self.extras()?,
                State::IcmpType => self.icmp_type()?,
                State::Keep => self.keep()?,
                State::Group => self.group()?,
                State::Trailing => self.trailing()?,
                State::Done => State::Done,
            };
        }
        self.finish()
    }

    fn action(&mut self) -> Result<State> {
        let word = self.expect()?;
        self.body.action = match word {
            "pass" => Action::Pass,
            "block" => Action::Block(self.block_return()?),
            "log" => Action::Log,
            "count" => Action::Account,
            "auth" => Action::Auth,
            "preauth" => Action::Preauth,
            "nomatch" => Action::NoMatch,
            "skip" => {
                let n = self.expect()?;
                Action::Skip(n.parse().map_err(|_| self.syntax(n))?)
            }
            "call" => {
                let now = self.tokens.next_if("now");
                let func = self.expect()?;
                Action::Call {
                    func: func.to_string(),
                    now,
                }
            }
            other => return Err(self.syntax(other)),
        };
        Ok(State::Direction)
    }

    fn block_return(&mut self) -> Result<Option<BlockReturn>> {
        let word = match self.tokens.peek() {
            Some(w) if w.starts_with("return-") => w,
            _ => return Ok(None),
        };
        self.tokens.next();
        if word == "return-rst" {
            return Ok(Some(BlockReturn::Rst));
        }
        let (as_dest, rest) = if let Some(rest) = word.strip_prefix("return-icmp-as-dest") {
            (true, rest)
        } else if let Some(rest) = word.strip_prefix("return-icmp") {
            (false, rest)
        } else {
            return Err(self.syntax(word));
        };
        let code = if rest.is_empty() {
            DEFAULT_RETURN_CODE
        } else {
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| self.syntax(word))?;
            self.field(parse_icmp_code(inner))?
        };
        Ok(Some(BlockReturn::Icmp { code, as_dest }))
    }

    fn direction(&mut self) -> Result<State> {
        let word = self.expect()?;
        self.body.direction = match word {
            "in" => Direction::In,
            "out" => Direction::Out,
            other => return Err(self.syntax(other)),
        };
        Ok(State::LogOptions)
    }

    fn log_options(&mut self) -> Result<State> {
        if self.tokens.next_if("log") {
            let mut log = LogSpec::default();
            loop {
                match self.tokens.peek() {
                    Some("body") => log.body = true,
                    Some("first") => log.first = true,
                    Some("or-block") => log.or_block = true,
                    Some("level") => {
                        self.tokens.next();
                        let text = self.expect()?;
                        log.level = Some(self.log_level(text)?);
                        continue;
                    }
                    _ => break,
                }
                self.tokens.next();
            }
            self.body.log = Some(log);
        }
        self.body.quick = self.tokens.next_if("quick");
        Ok(State::InterfaceBindings)
    }

    fn log_level(&self, text: &str) -> Result<LogLevel> {
        let (facility, pri) = match text.split_once('.') {
            Some((fac, pri)) => (Some(fac.to_string()), pri),
            None => (None, text),
        };
        let priority = Priority::from_name(pri).ok_or_else(|| self.syntax(text))?;
        Ok(LogLevel { facility, priority })
    }

    fn target(&mut self) -> Result<Target> {
        let text = self.expect()?;
        let (ifname, addr) = match text.split_once(':') {
            Some((ifname, addr)) => {
                let addr = self.field(parse_host(addr, self.hint_family(), self.resolver))?;
                (ifname, Some(addr))
            }
            None => (text, None),
        };
        Ok(Target {
            ifname: ifname.to_string(),
            addr,
        })
    }

    fn interface_bindings(&mut self) -> Result<State> {
        let mut on = false;
        if self.tokens.next_if("on") {
            let names = self.expect()?;
            let mut names = names.splitn(2, ',').map(str::to_string);
            self.body.ifaces.on = [names.next(), names.next()];
            on = true;
        }
        loop {
            match self.tokens.peek() {
                Some("dup-to") => {
                    self.tokens.next();
                    self.body.dup_to = Some(self.target()?);
                }
                // `to` only names a route target inside an `on` clause.
                Some("to") if on => {
                    self.tokens.next();
                    self.body.route_to = Some(self.target()?);
                }
                Some("fastroute") => {
                    self.tokens.next();
                    self.body.fastroute = true;
                }
                Some("in-via") => {
                    self.tokens.next();
                    self.body.ifaces.in_via = Some(self.expect()?.to_string());
                }
                Some("out-via") => {
                    self.tokens.next();
                    self.body.ifaces.out_via = Some(self.expect()?.to_string());
                }
                _ => break,
            }
        }
        Ok(State::TosTtl)
    }

    fn tos_ttl(&mut self) -> Result<State> {
        loop {
            match self.tokens.peek() {
                Some("family") => {
                    self.tokens.next();
                    let word = self.expect()?;
                    self.family = Some(match word {
                        "inet" => Family::V4,
                        "inet6" => Family::V6,
                        other => return Err(self.syntax(other)),
                    });
                }
                Some("tos") => {
                    self.tokens.next();
                    let word = self.expect()?;
                    let tos = parse_byte(word).ok_or_else(|| self.syntax(word))?;
                    self.body.coarse.require_tos(tos);
                }
                Some("ttl") => {
                    self.tokens.next();
                    let word = self.expect()?;
                    let ttl = parse_byte(word).ok_or_else(|| self.syntax(word))?;
                    self.body.coarse.require_ttl(ttl);
                }
                _ => break,
            }
        }
        Ok(State::Protocol)
    }

    fn set_proto(&mut self) -> Result<()> {
        let word = self.expect()?;
        if self.proto_text.is_some() {
            return Err(self.syntax("proto"));
        }
        let num = self.field(parse_proto(word, self.resolver))?;
        self.body.proto = ProtoMatch::from(num);
        match self.body.proto {
            ProtoMatch::Number(p) => self.body.coarse.require_proto(p),
            ProtoMatch::TcpUdp => self.body.coarse.require_flags(ipfilter_common::FI_TCPUDP, 0),
            ProtoMatch::Any => {}
        }
        self.proto_text = Some(match self.body.proto {
            ProtoMatch::Number(p) => proto_name(p).unwrap_or(word).to_string(),
            _ => word.to_string(),
        });
        // protocol may be known only now, so the return check happens here as well
        self.check_return_rst()
    }

    fn protocol(&mut self) -> Result<State> {
        if self.tokens.next_if("proto") {
            self.set_proto()?;
        }
        Ok(State::SourceHost)
    }

    fn host(&mut self) -> Result<HostMatch> {
        let family = self.hint_family();
        let res = parse_host_and_mask(&mut self.tokens, family, self.resolver);
        self.field(res)
    }

    fn source_host(&mut self) -> Result<State> {
        match self.tokens.next() {
            Some("all") => Ok(State::Extras),
            Some("from") => {
                self.body.src = self.host()?;
                Ok(State::SourcePorts)
            }
            Some(other) => Err(self.syntax(other)),
            None => Err(self.syntax(END_OF_LINE)),
        }
    }

    fn ports(&mut self, next: State) -> Result<State> {
        if self.tokens.peek() == Some("port") {
            let res = parse_ports(&mut self.tokens, self.proto_text.as_deref(), self.resolver);
            let cmp = self.field(res)?;
            match next {
                State::DestHost => self.body.sport = cmp,
                _ => self.body.dport = cmp,
            }
        }
        Ok(next)
    }

    fn dest_host(&mut self) -> Result<State> {
        match self.tokens.next() {
            Some("to") => {
                self.body.dst = self.host()?;
                Ok(State::DestPorts)
            }
            Some(other) => Err(self.syntax(other)),
            None => Err(self.syntax(END_OF_LINE)),
        }
    }

    fn extras(&mut self) -> Result<State> {
        loop {
            match self.tokens.peek() {
                Some("proto") => {
                    self.tokens.next();
                    self.set_proto()?;
                }
                Some("flags") => {
                    self.tokens.next();
                    if self.has_flags {
                        return Err(self.syntax("flags"));
                    }
                    let text = self.expect()?;
                    let (flags, mask) = self.field(parse_tcp_flags(text))?;
                    self.body.tcp_flags = flags;
                    self.body.tcp_mask = mask;
                    self.has_flags = true;
                }
                Some("with") => {
                    self.tokens.next();
                    self.with_items()?;
                }
                _ => break,
            }
        }
        Ok(State::IcmpType)
    }

    fn with_items(&mut self) -> Result<()> {
        let mut items = 0;
        loop {
            let negate = matches!(self.tokens.peek(), Some("not") | Some("no"));
            let name = if negate {
                self.tokens.peek_nth(1)
            } else {
                self.tokens.peek()
            };
            let Some(name) = name else { break };
            if name != "opt" && with_flag_bit(name).is_none() {
                if negate {
                    return Err(self.syntax(name));
                }
                break;
            }
            if negate {
                self.tokens.next();
            }
            self.tokens.next();

            if name == "opt" {
                let list = self.expect()?;
                if list == "sec-class" {
                    let classes = self.expect()?;
                    let bits = self.field(parse_secclass(classes))?;
                    match negate {
                        false => self.body.coarse.require_security(bits, 0),
                        true => self.body.coarse.require_security(0, bits),
                    }
                } else {
                    let bits = self.field(parse_ipopts(list))?;
                    match negate {
                        false => self.body.coarse.require_options(bits, 0),
                        true => self.body.coarse.require_options(0, bits),
                    }
                }
            } else if let Some(bit) = with_flag_bit(name) {
                match negate {
                    false => self.body.coarse.require_flags(bit, 0),
                    true => self.body.coarse.require_flags(0, bit),
                }
            }
            items += 1;
        }
        if items == 0 {
            let token = self.tokens.peek().unwrap_or(END_OF_LINE).to_string();
            return Err(self.syntax(&token));
        }
        Ok(())
    }

    fn icmp_type(&mut self) -> Result<State> {
        if self.tokens.next_if("icmp-type") {
            if self.has_icmp {
                return Err(self.syntax("icmp-type"));
            }
            let ty = self.expect()?;
            let code = if self.tokens.next_if("code") {
                Some(self.expect()?)
            } else {
                None
            };
            let (value, mask) = self.field(parse_icmp(ty, code))?;
            self.body.icmp = value;
            self.body.icmp_mask = mask;
            self.has_icmp = true;
        }
        Ok(State::Keep)
    }

    fn state_age(&mut self) -> Result<()> {
        let text = self.expect()?;
        let parse = |t: &str| t.parse::<Tick>().map_err(|_| self.syntax(text));
        let (lo, hi) = match text.split_once('/') {
            Some((lo, hi)) => (parse(lo)?, parse(hi)?),
            None => {
                let age = parse(text)?;
                (age, age)
            }
        };
        if lo > hi {
            return Err(self.semantic(format!("state-age {lo}/{hi} is inverted")));
        }
        self.body.state_age = Some((lo, hi));
        Ok(())
    }

    fn keep(&mut self) -> Result<State> {
        loop {
            match self.tokens.peek() {
                Some("keep") => {
                    self.tokens.next();
                    match self.expect()? {
                        "state" => self.body.keep_state = true,
                        "frag" => self.body.keep_frag = true,
                        "state-age" => {
                            if !self.body.keep_state {
                                return Err(self.semantic("state-age needs keep state"));
                            }
                            self.state_age()?
                        }
                        other => return Err(self.syntax(other)),
                    }
                }
                Some("state-age") => {
                    self.tokens.next();
                    if !self.body.keep_state {
                        return Err(self.semantic("state-age needs keep state"));
                    }
                    self.state_age()?;
                }
                Some("pps") => {
                    self.tokens.next();
                    let text = self.expect()?;
                    let pps = text.parse().map_err(|_| self.syntax(text))?;
                    self.body.pps = Some(pps);
                }
                _ => break,
            }
        }
        Ok(State::Group)
    }

    fn group(&mut self) -> Result<State> {
        loop {
            match self.tokens.peek() {
                Some("head") => {
                    self.tokens.next();
                    self.body.head = Some(self.expect()?.to_string());
                }
                Some("group") => {
                    self.tokens.next();
                    self.body.group = Some(self.expect()?.to_string());
                }
                _ => break,
            }
        }
        Ok(State::Trailing)
    }

    fn trailing(&mut self) -> Result<State> {
        match self.tokens.peek() {
            None => Ok(State::Done),
            Some(word) if CLAUSES.contains(&word) => Ok(State::Extras),
            Some(word) => Err(self.syntax(word)),
        }
    }

    fn check_return_rst(&self) -> Result<()> {
        if self.body.action == Action::Block(Some(BlockReturn::Rst))
            && self.body.proto != ProtoMatch::Number(IPPROTO_TCP)
            && self.body.proto != ProtoMatch::Any
        {
            return Err(self.mismatch("return-rst needs proto tcp"));
        }
        Ok(())
    }

    /// Settles the address family and any any-host placeholders.
    fn settle_family(&mut self) -> Result<Family> {
        let mut inferred = self.family;
        let addrs = [
            (!self.body.src.is_any()).then(|| self.body.src.family()),
            (!self.body.dst.is_any()).then(|| self.body.dst.family()),
            self.body
                .dup_to
                .as_ref()
                .and_then(|t| t.addr.as_ref().map(Address::family)),
            self.body
                .route_to
                .as_ref()
                .and_then(|t| t.addr.as_ref().map(Address::family)),
        ];
        for family in addrs.into_iter().flatten() {
            match inferred {
                Some(f) if f != family => {
                    return Err(self.semantic(format!(
                        "{} address in a {} rule",
                        family.as_str(),
                        f.as_str()
                    )))
                }
                _ => inferred = Some(family),
            }
        }
        let family = inferred.unwrap_or(self.default_family);
        for host in [&mut self.body.src, &mut self.body.dst] {
            if host.is_any() || host.mask().is_zero() {
                let any = HostMatch::any(family);
                *host = if host.negated() { any.negate() } else { any };
            }
        }
        Ok(family)
    }

    fn finish(mut self) -> Result<RuleBody> {
        let family = self.settle_family()?;
        self.body.family = family;
        self.body.coarse.require_version(family.version());

        if self.body.action == Action::Block(Some(BlockReturn::Rst))
            && !self.body.proto.is_tcp()
        {
            return Err(self.mismatch("return-rst needs proto tcp"));
        }
        if !(self.body.sport.is_any() && self.body.dport.is_any()) && !self.body.proto.allows_ports()
        {
            return Err(self.mismatch("port comparison needs proto tcp, udp or tcp/udp"));
        }
        if self.has_icmp && !self.body.proto.is_icmp() {
            return Err(self.mismatch("icmp-type needs proto icmp or ipv6-icmp"));
        }
        if self.has_flags && !(self.body.proto.is_tcp() || self.body.proto == ProtoMatch::TcpUdp) {
            return Err(self.mismatch("flags needs proto tcp"));
        }
        if let Action::Skip(_) = self.body.action {
            if self.body.quick || self.body.head.is_some() {
                return Err(self.semantic("skip cannot be combined with quick or head"));
            }
        }
        if self.body.state_age.is_some() && self.body.proto.is_tcp() {
            return Err(self.semantic("state-age cannot be used with proto tcp"));
        }
        if self.body.head.is_some() && self.body.head == self.body.group {
            return Err(self.semantic("rule cannot head the group it is in"));
        }
        Ok(self.body)
    }
}

fn parse_byte(text: &str) -> Option<u8> {
    match text.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
