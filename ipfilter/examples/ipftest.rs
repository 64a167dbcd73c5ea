// Runs packet descriptions through a rule file and prints each decision.
//
// Packet lines look like `in tcp 10.1.1.1,40000 192.168.0.1,80 S on le0`.
use std::{fs, net::IpAddr, path::PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use ipfilter::{Decision, Direction, Firewall, PacketSummary, Tunables};

#[derive(Debug, Parser)]
pub struct Opt {
    /// Rule file.
    #[clap(short, long)]
    rules: PathBuf,
    /// Packet descriptions, one per line.
    #[clap(short, long)]
    packets: PathBuf,
    /// Tunables as JSON.
    #[clap(short, long)]
    tunables: Option<PathBuf>,
}

fn endpoint(text: &str) -> anyhow::Result<(IpAddr, Option<u16>)> {
    match text.rsplit_once(',') {
        Some((addr, port)) => Ok((addr.parse()?, Some(port.parse()?))),
        None => Ok((text.parse()?, None)),
    }
}

fn tcp_flags(text: &str) -> anyhow::Result<u8> {
    text.chars().try_fold(0u8, |acc, c| {
        let bit = match c {
            'F' => ipfilter_common::TH_FIN,
            'S' => ipfilter_common::TH_SYN,
            'R' => ipfilter_common::TH_RST,
            'P' => ipfilter_common::TH_PUSH,
            'A' => ipfilter_common::TH_ACK,
            'U' => ipfilter_common::TH_URG,
            _ => bail!("unknown tcp flag `{c}`"),
        };
        Ok(acc | bit)
    })
}

fn parse_packet(line: &str) -> anyhow::Result<(Direction, PacketSummary)> {
    let mut words = line.split_whitespace();
    let mut next = |what: &str| words.next().ok_or_else(|| anyhow!("missing {what}"));
    let dir = match next("direction")? {
        "in" => Direction::In,
        "out" => Direction::Out,
        other => bail!("bad direction `{other}`"),
    };
    let proto = match next("protocol")? {
        "tcp" => ipfilter_common::IPPROTO_TCP,
        "udp" => ipfilter_common::IPPROTO_UDP,
        "icmp" => ipfilter_common::IPPROTO_ICMP,
        other => other.parse().context("bad protocol")?,
    };
    let (src, sport) = endpoint(next("source")?)?;
    let (dst, dport) = endpoint(next("destination")?)?;

    let mut packet = PacketSummary::new(src, dst).with_proto(proto).with_len(40);
    if let (Some(s), Some(d)) = (sport, dport) {
        packet = packet.with_ports(s, d);
    }
    while let Some(word) = words.next() {
        packet = match word {
            "on" => {
                let ifname = words.next().ok_or_else(|| anyhow!("missing interface"))?;
                match dir {
                    Direction::In => packet.with_in_if(ifname),
                    Direction::Out => packet.with_out_if(ifname),
                }
            }
            flags => packet.with_tcp_flags(tcp_flags(flags)?),
        };
    }
    Ok((dir, packet))
}

fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();
    tracing_subscriber::fmt::init();

    let tunables = match &opt.tunables {
        Some(path) => Tunables::load(path)?,
        None => Tunables::default(),
    };
    let firewall = Firewall::with_tunables(tunables);
    let rules = fs::read_to_string(&opt.rules)
        .with_context(|| format!("reading {}", opt.rules.display()))?;
    let (count, errors) = firewall.reload(&rules)?;
    for e in &errors {
        tracing::error!("{e}");
    }
    tracing::info!(rules = count, "rules loaded");

    let packets = fs::read_to_string(&opt.packets)
        .with_context(|| format!("reading {}", opt.packets.display()))?;
    for (now, line) in packets
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .enumerate()
    {
        let (dir, packet) = parse_packet(line).with_context(|| format!("packet `{line}`"))?;
        let now = now as u64;
        firewall.expire(now);
        let outcome = firewall.check(dir, &packet, now);
        let decision = match outcome.decision {
            Decision::Pass => "pass",
            Decision::Block(_) => "block",
            Decision::Auth => "auth",
        };
        match outcome.rule {
            Some(rule) => println!("{decision} {line} (@{} {rule})", rule.line()),
            None => println!("{decision} {line}"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&firewall.stats())?);
    Ok(())
}
