//! Parser for the GRUB `menuentry` stanza a frugal install ships as
//! `grub.entry`, using nom combinators.

use nom::{
    bytes::complete::{escaped, tag, take_until},
    character::complete::{multispace0, multispace1, none_of},
    error::{Error, ErrorKind, ParseError},
    sequence::delimited,
    Err, IResult, Parser,
};

/// Commands inside a menuentry that matter for booting it directly.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MenuentryBody<'a> {
    /// Arguments of `search`.
    pub(crate) search: Option<&'a str>,
    /// Arguments of `linux` (or `linuxefi`), kernel path first.
    pub(crate) linux: Option<&'a str>,
    /// Arguments of `initrd` (or `initrdefi`).
    pub(crate) initrd: Option<&'a str>,
}

impl<'a> From<Vec<(&'a str, &'a str)>> for MenuentryBody<'a> {
    fn from(commands: Vec<(&'a str, &'a str)>) -> Self {
        let mut body = Self::default();
        for (key, value) in commands {
            match key {
                "search" => body.search = Some(value),
                "linux" | "linuxefi" => body.linux = Some(value),
                "initrd" | "initrdefi" => body.initrd = Some(value),
                _ => tracing::trace!("Ignoring menuentry command {key}"),
            }
        }
        body
    }
}

impl<'a> MenuentryBody<'a> {
    /// The filesystem UUID given to `search --fs-uuid`.
    pub(crate) fn fs_uuid(&self) -> Option<&'a str> {
        let mut args = self.search?.split_whitespace();
        args.by_ref().find(|a| *a == "--fs-uuid")?;
        args.next().map(|u| u.trim_matches('"'))
    }

    /// Kernel command line arguments, without the kernel path.
    pub(crate) fn kernel_args(&self) -> impl Iterator<Item = &'a str> {
        self.linux
            .into_iter()
            .flat_map(|l| l.split_whitespace().skip(1))
    }
}

/// A complete menuentry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MenuEntry<'a> {
    /// Display title with escapes removed.
    pub(crate) title: String,
    /// Commands within the block.
    pub(crate) body: MenuentryBody<'a>,
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Take everything up to the bracket closing an already opened one.
fn take_until_balanced(open: char, close: char) -> impl Fn(&str) -> IResult<&str, &str> {
    move |i: &str| {
        let mut index = 0;
        let mut depth = 0i32;
        while let Some(n) = i[index..].find(&[open, close, '\\'][..]) {
            index += n;
            let mut chars = i[index..].chars();
            match chars.next() {
                Some('\\') => {
                    index += '\\'.len_utf8();
                    index += chars.next().map_or(0, char::len_utf8);
                }
                Some(c) if c == open => {
                    depth += 1;
                    index += open.len_utf8();
                }
                Some(_) => {
                    if depth == 0 {
                        return Ok((&i[index..], &i[..index]));
                    }
                    depth -= 1;
                    index += close.len_utf8();
                }
                None => break,
            }
        }
        Err(Err::Error(Error::from_error_kind(i, ErrorKind::TakeUntil)))
    }
}

fn parse_menuentry(input: &str) -> IResult<&str, MenuEntry<'_>> {
    let (input, _) = tag("menuentry").parse(input)?;
    let (input, _) = multispace1.parse(input)?;
    let (input, title) = delimited(
        tag("\""),
        escaped(none_of("\\\""), '\\', none_of("")),
        tag("\""),
    )
    .parse(input)?;
    // Options such as --class come between the title and the block
    let (input, _) = take_until("{").parse(input)?;
    let (input, body) =
        delimited(tag("{"), take_until_balanced('{', '}'), tag("}")).parse(input)?;

    let commands = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| match l.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => (l, ""),
        })
        .collect::<Vec<_>>();

    Ok((
        input,
        MenuEntry {
            title: unescape(title),
            body: MenuentryBody::from(commands),
        },
    ))
}

fn parse_all(input: &str) -> IResult<&str, Vec<MenuEntry<'_>>> {
    let mut entries = Vec::new();
    let mut remaining = input;
    while let Ok((next, _)) = take_until::<_, _, Error<&str>>("menuentry").parse(remaining) {
        let (next, entry) = parse_menuentry(next)?;
        entries.push(entry);
        let (next, _) = multispace0(next)?;
        remaining = next;
    }
    Ok((remaining, entries))
}

/// Parse every menuentry in `contents`.
pub(crate) fn parse_grub_menuentry_file(contents: &str) -> anyhow::Result<Vec<MenuEntry<'_>>> {
    let (_, entries) =
        parse_all(contents).map_err(|e| anyhow::anyhow!("Failed to parse GRUB menuentries: {e}"))?;
    if entries.iter().any(|e| e.title.is_empty()) {
        anyhow::bail!("Found menuentry with empty title");
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_frugal_entry() {
        let contents = indoc! { r#"
            # Frugal entry for MX-23.6_x64
            menuentry "MX-23.6_x64 frugal" --class mx {
                search --no-floppy --set=root --fs-uuid 6d1f7e2c-4b3a-4c9e-8f21-0a9b8c7d6e5f
                linux /MX-Frugal/vmlinuz bdir=MX-Frugal buuid=6d1f7e2c-4b3a-4c9e-8f21-0a9b8c7d6e5f quiet frugal_persist
                initrd /MX-Frugal/initrd.gz
            }
        "# };
        let entries = parse_grub_menuentry_file(contents).unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.title, "MX-23.6_x64 frugal");
        assert_eq!(
            e.body.fs_uuid(),
            Some("6d1f7e2c-4b3a-4c9e-8f21-0a9b8c7d6e5f")
        );
        assert_eq!(
            e.body.kernel_args().collect::<Vec<_>>(),
            vec![
                "bdir=MX-Frugal",
                "buuid=6d1f7e2c-4b3a-4c9e-8f21-0a9b8c7d6e5f",
                "quiet",
                "frugal_persist"
            ]
        );
        assert_eq!(e.body.initrd, Some("/MX-Frugal/initrd.gz"));
    }

    #[test]
    fn test_multiple_and_nested() {
        let contents = indoc! { r#"
            set timeout=5
            menuentry "First" {
                if [ x$feature_all_video_module = xy ]; then
                    insmod all_video
                fi
                linuxefi /vmlinuz-6.1 root=UUID=abc ro
            }

            menuentry "Title with \"quotes\"" {
                insmod fat
                search --label --set=root FRUGAL
            }
        "# };
        let entries = parse_grub_menuentry_file(contents).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "First");
        assert_eq!(
            entries[0].body.linux,
            Some("/vmlinuz-6.1 root=UUID=abc ro")
        );
        assert_eq!(entries[0].body.search, None);
        assert_eq!(entries[1].title, "Title with \"quotes\"");
        // Searching by label yields no UUID
        assert_eq!(entries[1].body.fs_uuid(), None);
        assert_eq!(entries[1].body.kernel_args().count(), 0);
    }

    #[test]
    fn test_quoted_uuid() {
        let contents = r#"menuentry "x" { search --fs-uuid "1234-ABCD" }"#;
        let entries = parse_grub_menuentry_file(contents).unwrap();
        assert_eq!(entries[0].body.fs_uuid(), Some("1234-ABCD"));
    }

    #[test]
    fn test_invalid() {
        assert!(parse_grub_menuentry_file("").unwrap().is_empty());
        assert!(parse_grub_menuentry_file("no entries here").unwrap().is_empty());
        assert!(parse_grub_menuentry_file(r#"menuentry "Unclosed" { linux /vmlinuz"#).is_err());
        assert!(parse_grub_menuentry_file(r#"menuentry "" { }"#).is_err());
        assert!(parse_grub_menuentry_file("menuentry noquotes { }").is_err());
    }
}
