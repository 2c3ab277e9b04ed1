//! Hand-rolled command-line parsing for the `proxyd` binary (spec §6).
//!
//! The grammar repeats a `<bus-address> <socket-path> [options...]` group
//! for any number of proxies in one process; that repetition, terminated
//! by either the next positional pair or end of input, does not map onto
//! a declarative derive-based parser, so this is a small hand-written
//! state machine instead.

use crate::error::CliError;
use crate::policy::{Filter, FilterType, PolicyLevel, PolicyStore};

/// One `<bus-address> <socket-path> [options...]` group.
pub struct ProxySpec {
    /// Address of the upstream bus to connect to per accepted client.
    pub bus_address: String,
    /// Local `AF_UNIX` path to listen on.
    pub socket_path: String,
    /// This proxy's filled-in Policy Store.
    pub policy: PolicyStore,
    /// Whether `--filter` was given (enable the Router; otherwise the
    /// session degenerates to byte forwarding per spec §4.3).
    pub filtering: bool,
    /// `--sloppy-names`.
    pub sloppy_names: bool,
}

/// Parsed command line for the whole process.
pub struct Cli {
    /// A synchronization pipe fd; its EOF terminates the whole process
    /// cleanly (exit 0).
    pub sync_fd: Option<i32>,
    /// A descriptor to read additional NUL-separated arguments from,
    /// spliced in place where `--args=N` appeared.
    pub args_fd: Option<i32>,
    /// Raise the log filter (spec §6, `--log`).
    pub verbose_log: bool,
    /// One entry per `<bus-address> <socket-path> [...]` group.
    pub proxies: Vec<ProxySpec>,
}

/// Parse `argv` (excluding argv[0]) into a [`Cli`]. `read_args_fd` is
/// injected so tests don't need a real file descriptor; production code
/// passes [`read_nul_separated_fd`].
pub fn parse(argv: &[String], read_args_fd: impl Fn(i32) -> std::io::Result<Vec<String>>) -> Result<Cli, CliError> {
    let mut tokens = splice_args_fd(argv.to_vec(), &read_args_fd)?;

    let mut sync_fd = None;
    let mut args_fd_seen = false;
    let mut verbose_log = false;
    let mut proxies = Vec::new();

    // Process-level flags may appear anywhere; strip them out first,
    // leaving the positional proxy-spec groups behind in order.
    let mut remaining = Vec::new();
    let mut iter = tokens.drain(..);
    while let Some(tok) = iter.next() {
        if let Some(value) = tok.strip_prefix("--fd=") {
            sync_fd = Some(parse_fd(value)?);
        } else if tok.strip_prefix("--args=").is_some() {
            // Already spliced by `splice_args_fd`; just remember we saw
            // (and consumed) it so a second occurrence is not silently
            // dropped as a positional token.
            args_fd_seen = true;
        } else if tok == "--log" {
            verbose_log = true;
        } else {
            remaining.push(tok);
        }
    }
    let _ = args_fd_seen;

    let mut i = 0;
    while i < remaining.len() {
        let bus_address = remaining[i].clone();
        i += 1;
        let socket_path = remaining.get(i).cloned().ok_or_else(|| {
            CliError::Usage(format!("bus address {bus_address:?} has no paired socket path"))
        })?;
        i += 1;

        let mut policy = PolicyStore::new();
        let mut filtering = false;
        let mut sloppy_names = false;

        while i < remaining.len() && !looks_positional(&remaining[i], &remaining.get(i + 1)) {
            let opt = &remaining[i];
            parse_option(opt, &mut policy, &mut filtering, &mut sloppy_names)?;
            i += 1;
        }

        proxies.push(ProxySpec { bus_address, socket_path, policy, filtering, sloppy_names });
    }

    if proxies.is_empty() {
        return Err(CliError::Usage("no proxy specification given".into()));
    }

    Ok(Cli { sync_fd, args_fd: None, verbose_log, proxies })
}

/// A token "looks positional" (starts a new `<bus-address> <socket-path>`
/// pair) if it does not start with `--` and the token after it also does
/// not start with `--` (a lone trailing bus-address with no socket path
/// is a usage error caught later, not reinterpreted as an option).
fn looks_positional(tok: &str, next: &Option<&String>) -> bool {
    !tok.starts_with("--") && next.map(|n| !n.starts_with("--")).unwrap_or(true)
}

fn parse_option(
    opt: &str,
    policy: &mut PolicyStore,
    filtering: &mut bool,
    sloppy_names: &mut bool,
) -> Result<(), CliError> {
    if let Some(name) = opt.strip_prefix("--see=") {
        add_plain_filter(policy, name, PolicyLevel::See);
    } else if let Some(name) = opt.strip_prefix("--talk=") {
        add_plain_filter(policy, name, PolicyLevel::Talk);
    } else if let Some(name) = opt.strip_prefix("--own=") {
        add_plain_filter(policy, name, PolicyLevel::Own);
    } else if let Some(rest) = opt.strip_prefix("--call=") {
        add_detailed_filter(policy, rest, FilterType::Call)?;
    } else if let Some(rest) = opt.strip_prefix("--broadcast=") {
        add_detailed_filter(policy, rest, FilterType::Broadcast)?;
    } else if opt == "--filter" {
        *filtering = true;
    } else if opt == "--sloppy-names" {
        *sloppy_names = true;
    } else if opt == "--log" {
        // Accepted anywhere, including inside a proxy-spec group.
    } else {
        return Err(CliError::Usage(format!("unrecognized option {opt:?}")));
    }

    Ok(())
}

fn add_plain_filter(policy: &mut PolicyStore, name: &str, level: PolicyLevel) {
    let (name, is_subtree) = split_subtree(name);
    policy.add(Filter::plain(name.to_string(), is_subtree, level));
}

/// `NAME=RULE` where `RULE` is `[IFACE.METHOD|IFACE.*|*][@/path[/*]]`
/// (spec §6).
fn add_detailed_filter(policy: &mut PolicyStore, spec: &str, kind: FilterType) -> Result<(), CliError> {
    let (name_part, rule) = spec
        .split_once('=')
        .ok_or_else(|| CliError::Usage(format!("{spec:?} is missing '=RULE'")))?;
    let (name, name_is_subtree) = split_subtree(name_part);

    let (iface_method, path_part) = match rule.split_once('@') {
        Some((a, b)) => (a, Some(b)),
        None => (rule, None),
    };

    let (interface, member) = if iface_method == "*" || iface_method.is_empty() {
        (None, None)
    } else if let Some((iface, method)) = iface_method.rsplit_once('.') {
        if method == "*" {
            (Some(iface.to_string()), None)
        } else {
            (Some(iface.to_string()), Some(method.to_string()))
        }
    } else {
        (None, Some(iface_method.to_string()))
    };

    let object_path = path_part.map(|p| {
        if let Some(prefix) = p.strip_suffix("/*") {
            (prefix.to_string(), true)
        } else {
            (p.to_string(), false)
        }
    });

    let mut type_mask = std::collections::HashSet::new();
    type_mask.insert(kind);

    policy.add(Filter {
        name: name.to_string(),
        name_is_subtree,
        policy_level: PolicyLevel::Talk,
        type_mask: Some(type_mask),
        object_path,
        interface,
        member,
    });

    Ok(())
}

fn split_subtree(name: &str) -> (&str, bool) {
    match name.strip_suffix(".*") {
        Some(prefix) => (prefix, true),
        None => (name, false),
    }
}

fn parse_fd(value: &str) -> Result<i32, CliError> {
    value.parse::<i32>().map_err(|_| CliError::Usage(format!("invalid file descriptor {value:?}")))
}

fn splice_args_fd(
    tokens: Vec<String>,
    read_args_fd: &impl Fn(i32) -> std::io::Result<Vec<String>>,
) -> Result<Vec<String>, CliError> {
    let mut out = Vec::with_capacity(tokens.len());

    for tok in tokens {
        if let Some(value) = tok.strip_prefix("--args=") {
            let fd = parse_fd(value)?;
            let extra = read_args_fd(fd)
                .map_err(|e| CliError::Usage(format!("failed reading --args={fd}: {e}")))?;
            out.extend(extra);
        } else {
            out.push(tok);
        }
    }

    Ok(out)
}
