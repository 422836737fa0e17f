//! Dockerfile lexing, parsing, and evaluation (SPEC_FULL.md §4.6).
//!
//! The evaluator never executes build steps; it only folds directives
//! left-to-right over an `ImageSpec`. Dispatch is a tagged sum type
//! (`Directive`) with a single `evaluate` method, not a class hierarchy.

pub mod imagespec;

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

pub use imagespec::{BuildStep, ExposedPort, ImageSpec, OnBuildTrigger, Protocol};

/// Resolves a `FROM name:tag` reference to an image id and its inherited spec.
/// Implemented by the registry client (§4.8/§12); kept as a trait here so the
/// evaluator's folding logic is testable without a live registry.
pub trait ImageMetadataResolver {
    fn resolve(&self, name: &str, tag: &str) -> Result<(String, ImageSpec)>;
}

/// A single Dockerfile directive. Each variant is a pure
/// `ImageSpec -> Result<ImageSpec>` transformation dispatched from
/// `evaluate`, rather than a class-per-directive hierarchy (SPEC_FULL.md §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    From { name: String, tag: String },
    Maintainer(String),
    Env(Vec<(String, String)>),
    Workdir(String),
    User(String),
    Expose(Vec<ExposedPort>),
    Volume(Vec<String>),
    Add { sources: Vec<String>, dest: String },
    Copy { sources: Vec<String>, dest: String },
    Run(Vec<String>),
    Cmd(Vec<String>),
    Entrypoint(Vec<String>),
    OnBuild(Box<Directive>),
    /// Accepted and ignored, preserved for compatibility with older
    /// Dockerfiles — SPEC_FULL.md §9's decision on the `INSERT` directive.
    Insert(String),
}

const ONBUILD_FORBIDDEN: &[&str] = &["ONBUILD", "FROM", "MAINTAINER"];

impl Directive {
    /// Fold this directive over `spec`, resolving a `FROM` against `resolver`
    /// when one is supplied. `base_fired` tracks whether a `FROM` has already
    /// been evaluated, since SPEC_FULL.md requires it be permitted only once.
    fn evaluate(
        &self,
        mut spec: ImageSpec,
        resolver: Option<&dyn ImageMetadataResolver>,
        from_seen: &mut bool,
    ) -> Result<ImageSpec> {
        match self {
            Directive::From { name, tag } => {
                if *from_seen {
                    bail!("FROM may only appear once per Dockerfile");
                }
                *from_seen = true;
                if let Some(resolver) = resolver {
                    let (image_id, base) = resolver.resolve(name, tag)?;
                    spec = base;
                    spec.base_image_id = Some(image_id);
                    spec.base_image_ref = Some((name.clone(), tag.clone()));
                    let triggers = std::mem::take(&mut spec.onbuild);
                    for trigger in triggers {
                        let nested = parse_directive_line(&trigger.0)?;
                        spec = nested.evaluate(spec, Some(resolver), from_seen)?;
                    }
                } else {
                    spec.base_image_ref = Some((name.clone(), tag.clone()));
                }
                Ok(spec)
            }
            Directive::Maintainer(who) => {
                spec.maintainer = Some(who.clone());
                Ok(spec)
            }
            Directive::Env(pairs) => {
                for (k, v) in pairs {
                    let expanded = expand(v, &spec.env)?;
                    spec.env.insert(k.clone(), expanded);
                }
                Ok(spec)
            }
            Directive::Workdir(dir) => {
                spec.workdir = expand(dir, &spec.env)?;
                Ok(spec)
            }
            Directive::User(user) => {
                spec.user = expand(user, &spec.env)?;
                Ok(spec)
            }
            Directive::Expose(ports) => {
                spec.exposed_ports.extend(ports.iter().copied());
                Ok(spec)
            }
            Directive::Volume(paths) => {
                for path in paths {
                    spec.volumes.insert(expand(path, &spec.env)?);
                }
                Ok(spec)
            }
            Directive::Add { sources, dest } => {
                spec.run_commands.push(BuildStep::Add {
                    sources: sources.clone(),
                    dest: dest.clone(),
                });
                Ok(spec)
            }
            Directive::Copy { sources, dest } => {
                spec.run_commands.push(BuildStep::Copy {
                    sources: sources.clone(),
                    dest: dest.clone(),
                });
                Ok(spec)
            }
            Directive::Run(cmd) => {
                spec.run_commands.push(BuildStep::Run(cmd.clone()));
                Ok(spec)
            }
            Directive::Cmd(cmd) => {
                spec.command = Some(cmd.clone());
                Ok(spec)
            }
            Directive::Entrypoint(cmd) => {
                spec.entrypoint = Some(cmd.clone());
                Ok(spec)
            }
            Directive::OnBuild(inner) => {
                spec.onbuild.push(OnBuildTrigger(unparse_directive(inner)));
                Ok(spec)
            }
            Directive::Insert(_) => Ok(spec),
        }
    }
}

/// Parse and fold a whole Dockerfile against a starting spec (normally
/// `ImageSpec::default()`), resolving `FROM` through `resolver` when given.
pub fn evaluate(src: &str, resolver: Option<&dyn ImageMetadataResolver>) -> Result<ImageSpec> {
    let directives = parse_dockerfile(src)?;
    let mut spec = ImageSpec::default();
    let mut from_seen = false;
    for directive in &directives {
        spec = directive.evaluate(spec, resolver, &mut from_seen)?;
    }
    Ok(spec)
}

/// Lex a Dockerfile into logical lines (continuations joined, comments and
/// blank lines dropped even between continued lines) then parse each into a
/// `Directive`.
pub fn parse_dockerfile(src: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();
    for logical_line in logical_lines(src) {
        directives.push(parse_directive_line(&logical_line)?);
    }
    Ok(directives)
}

fn logical_lines(src: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut continuing = false;

    for raw in src.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            // Comment/blank lines are skipped even mid-continuation, per
            // SPEC_FULL.md §4.6's lexical rules.
            continue;
        }

        if continuing {
            current.push(' ');
            current.push_str(trimmed);
        } else {
            current = trimmed.to_string();
        }

        if let Some(stripped) = current.strip_suffix('\\') {
            current = stripped.trim_end().to_string();
            continuing = true;
        } else {
            lines.push(std::mem::take(&mut current));
            continuing = false;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn parse_directive_line(line: &str) -> Result<Directive> {
    let (name, rest) = line
        .split_once(char::is_whitespace)
        .unwrap_or((line, ""));
    let name = name.to_ascii_uppercase();
    let rest = rest.trim_start();
    parse_directive(&name, rest)
}

fn parse_directive(name: &str, rest: &str) -> Result<Directive> {
    match name {
        "FROM" => {
            let (image, tag) = match rest.split_once(':') {
                Some((i, t)) => (i.to_string(), t.to_string()),
                None => (rest.to_string(), "latest".to_string()),
            };
            Ok(Directive::From { name: image, tag })
        }
        "MAINTAINER" => Ok(Directive::Maintainer(rest.to_string())),
        "ENV" => Ok(Directive::Env(parse_env(rest)?)),
        "WORKDIR" => Ok(Directive::Workdir(rest.to_string())),
        "USER" => Ok(Directive::User(rest.to_string())),
        "EXPOSE" => Ok(Directive::Expose(parse_expose(rest)?)),
        "VOLUME" => Ok(Directive::Volume(parse_volume(rest)?)),
        "ADD" => {
            let (sources, dest) = parse_src_dest(rest)?;
            Ok(Directive::Add { sources, dest })
        }
        "COPY" => {
            let (sources, dest) = parse_src_dest(rest)?;
            Ok(Directive::Copy { sources, dest })
        }
        "RUN" => Ok(Directive::Run(parse_command(rest)?)),
        "CMD" => Ok(Directive::Cmd(parse_command(rest)?)),
        "ENTRYPOINT" => Ok(Directive::Entrypoint(parse_command(rest)?)),
        "ONBUILD" => {
            let (inner_name, inner_rest) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));
            let inner_name = inner_name.to_ascii_uppercase();
            if ONBUILD_FORBIDDEN.contains(&inner_name.as_str()) {
                bail!("{inner_name} is not allowed inside ONBUILD");
            }
            let inner = parse_directive(&inner_name, inner_rest.trim_start())?;
            Ok(Directive::OnBuild(Box::new(inner)))
        }
        "INSERT" => Ok(Directive::Insert(rest.to_string())),
        other => bail!("unsupported directive: {other}"),
    }
}

fn unparse_directive(directive: &Directive) -> String {
    match directive {
        Directive::From { name, tag } => format!("FROM {name}:{tag}"),
        Directive::Maintainer(who) => format!("MAINTAINER {who}"),
        Directive::Workdir(dir) => format!("WORKDIR {dir}"),
        Directive::User(user) => format!("USER {user}"),
        Directive::Run(cmd) => format!("RUN {}", cmd.join(" ")),
        Directive::Cmd(cmd) => format!("CMD {}", cmd.join(" ")),
        Directive::Entrypoint(cmd) => format!("ENTRYPOINT {}", cmd.join(" ")),
        Directive::Insert(rest) => format!("INSERT {rest}"),
        Directive::OnBuild(inner) => format!("ONBUILD {}", unparse_directive(inner)),
        _ => String::new(),
    }
}

/// `ENV K V...` (rest of line is value) or `ENV K=V [K2=V2 ...]`.
fn parse_env(rest: &str) -> Result<Vec<(String, String)>> {
    if rest.contains('=') {
        let mut pairs = Vec::new();
        for word in split_words(rest)? {
            let (k, v) = word
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed ENV pair: {word}"))?;
            pairs.push((k.to_string(), strip_quotes(v).to_string()));
        }
        Ok(pairs)
    } else {
        let (key, value) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow!("ENV requires a key and value"))?;
        Ok(vec![(key.to_string(), value.trim_start().to_string())])
    }
}

fn parse_expose(rest: &str) -> Result<Vec<ExposedPort>> {
    let mut ports = Vec::new();
    for word in rest.split_whitespace() {
        let (port_str, proto_str) = word.split_once('/').unwrap_or((word, "tcp"));
        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow!("invalid EXPOSE port: {port_str}"))?;
        let protocol: Protocol = proto_str.parse().map_err(|e: String| anyhow!(e))?;
        ports.push(ExposedPort { port, protocol });
    }
    Ok(ports)
}

/// `VOLUME path` or the JSON-array form `VOLUME ["/a","/b"]`.
fn parse_volume(rest: &str) -> Result<Vec<String>> {
    let trimmed = rest.trim();
    if trimmed.starts_with('[') {
        let values: Vec<String> = serde_json::from_str(trimmed)?;
        Ok(values)
    } else {
        Ok(trimmed.split_whitespace().map(String::from).collect())
    }
}

/// `RUN`/`CMD`/`ENTRYPOINT` value: JSON-array form is taken verbatim, anything
/// else runs as `/bin/sh -c value`.
fn parse_command(rest: &str) -> Result<Vec<String>> {
    let trimmed = rest.trim();
    if trimmed.starts_with('[') {
        let argv: Vec<String> = serde_json::from_str(trimmed)?;
        Ok(argv)
    } else {
        Ok(vec!["/bin/sh".to_string(), "-c".to_string(), trimmed.to_string()])
    }
}

/// `ADD`/`COPY src... dst`; multiple sources require a directory destination.
fn parse_src_dest(rest: &str) -> Result<(Vec<String>, String)> {
    let words = split_words(rest)?;
    if words.len() < 2 {
        bail!("ADD/COPY requires at least one source and a destination");
    }
    let (dest, sources) = words.split_last().unwrap();
    if sources.len() > 1 && !dest.ends_with('/') {
        bail!("multi-source ADD/COPY destination must be a directory (trailing /)");
    }
    Ok((sources.to_vec(), dest.clone()))
}

/// Split on whitespace, honoring single/double quoting so a quoted value may
/// contain spaces.
fn split_words(s: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = s.chars().peekable();
    let mut current = String::new();
    let mut in_word = false;

    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                in_word = true;
                let quote = c;
                for qc in chars.by_ref() {
                    if qc == quote {
                        break;
                    }
                    current.push(qc);
                }
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    in_word = true;
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Expand `$VAR` and `${VAR}` references against `env`; backslash escapes a
/// single character (including `$`).
pub fn expand(input: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let input = strip_quotes(input);
    let mut out = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '$' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    let mut name = String::new();
                    for nc in chars.by_ref() {
                        if nc == '}' {
                            break;
                        }
                        name.push(nc);
                    }
                    out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
                } else {
                    let mut name = String::new();
                    while let Some(&nc) = chars.peek() {
                        if nc.is_alphanumeric() || nc == '_' {
                            name.push(nc);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
                }
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_expansion_s1() {
        let src = "ENV A /x\nENV B ${A}/y\nENV C $A$B\n";
        let spec = evaluate(src, None).unwrap();
        assert_eq!(spec.env.get("A").unwrap(), "/x");
        assert_eq!(spec.env.get("B").unwrap(), "/x/y");
        assert_eq!(spec.env.get("C").unwrap(), "/x/x/y");
    }

    #[test]
    fn volume_json_s2() {
        let src = r#"VOLUME ["/data","/logs"]"#;
        let spec = evaluate(src, None).unwrap();
        assert!(spec.volumes.contains("/data"));
        assert!(spec.volumes.contains("/logs"));
        assert_eq!(spec.volumes.len(), 2);
    }

    #[test]
    fn expose_default_protocol_is_tcp() {
        let spec = evaluate("EXPOSE 8080 53/udp", None).unwrap();
        assert!(spec.exposed_ports.contains(&ExposedPort {
            port: 8080,
            protocol: Protocol::Tcp
        }));
        assert!(spec.exposed_ports.contains(&ExposedPort {
            port: 53,
            protocol: Protocol::Udp
        }));
    }

    #[test]
    fn run_shell_form_wraps_in_sh_c() {
        let spec = evaluate("RUN echo hi", None).unwrap();
        match &spec.run_commands[0] {
            BuildStep::Run(cmd) => assert_eq!(cmd, &vec!["/bin/sh", "-c", "echo hi"]),
            _ => panic!("expected RUN step"),
        }
    }

    #[test]
    fn run_json_array_form_is_verbatim() {
        let spec = evaluate(r#"RUN ["echo", "hi"]"#, None).unwrap();
        match &spec.run_commands[0] {
            BuildStep::Run(cmd) => assert_eq!(cmd, &vec!["echo", "hi"]),
            _ => panic!("expected RUN step"),
        }
    }

    #[test]
    fn from_may_only_appear_once() {
        let err = evaluate("FROM a\nFROM b", None).unwrap_err();
        assert!(err.to_string().contains("FROM"));
    }

    #[test]
    fn onbuild_forbids_nested_from_and_maintainer() {
        assert!(parse_dockerfile("ONBUILD FROM x").is_err());
        assert!(parse_dockerfile("ONBUILD MAINTAINER x").is_err());
        assert!(parse_dockerfile("ONBUILD RUN echo hi").is_ok());
    }

    #[test]
    fn insert_is_accepted_and_ignored() {
        let spec = evaluate("INSERT anything here", None).unwrap();
        assert_eq!(spec, ImageSpec::default());
    }

    #[test]
    fn line_continuation_joins_across_comment_lines() {
        let lines = logical_lines("RUN echo a \\\n# a comment\nb\n");
        assert_eq!(lines, vec!["RUN echo a b".to_string()]);
    }

    #[test]
    fn multi_source_copy_requires_directory_dest() {
        assert!(parse_directive("COPY", "a b c").is_err());
        assert!(parse_directive("COPY", "a b c/").is_ok());
    }

    struct FakeResolver;
    impl ImageMetadataResolver for FakeResolver {
        fn resolve(&self, _name: &str, _tag: &str) -> Result<(String, ImageSpec)> {
            let mut base = ImageSpec::default();
            base.user = "appuser".to_string();
            base.onbuild.push(OnBuildTrigger("RUN echo inherited".to_string()));
            Ok(("0".repeat(64), base))
        }
    }

    #[test]
    fn from_inherits_and_fires_onbuild() {
        let resolver = FakeResolver;
        let spec = evaluate("FROM base:latest", Some(&resolver)).unwrap();
        assert_eq!(spec.user, "appuser");
        assert_eq!(spec.base_image_id, Some("0".repeat(64)));
        assert!(spec.onbuild.is_empty());
        assert_eq!(spec.run_commands.len(), 1);
    }
}
