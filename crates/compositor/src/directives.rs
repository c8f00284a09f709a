//! Comment directives embedded in program source.
//!
//! ```text
//! // @param tint color 1 0.5 0.2
//! // @param warp float 0.25 0 1
//! // @param bands float[4] 0 0 0 0
//! // @channel0 texture noise.png
//! // @channel1 audio fft 512
//! // @vertices 36
//! ```
//!
//! Malformed directives are skipped with a warning; parsing never fails.

use tracing::warn;

use crate::frame::CHANNEL_COUNT;
use crate::params::{ParamDef, ParamKind, ParamValue};
use crate::program::{ChannelDirective, ChannelKind, DirectiveParser, ProgramInterface};

#[derive(Debug, Clone, Copy, Default)]
pub struct CommentDirectiveParser;

impl DirectiveParser for CommentDirectiveParser {
    fn parse(&self, source: &str) -> ProgramInterface {
        let mut interface = ProgramInterface::default();
        for (line_no, line) in source.lines().enumerate() {
            let Some(body) = line.trim().strip_prefix("//") else {
                continue;
            };
            let Some(directive) = body.trim().strip_prefix('@') else {
                continue;
            };
            let mut words = directive.split_whitespace();
            let Some(head) = words.next() else {
                continue;
            };
            let rest: Vec<&str> = words.collect();
            let parsed = match head {
                "param" => parse_param(&rest).map(|def| {
                    interface.params.retain(|existing| existing.name != def.name);
                    interface.params.push(def);
                }),
                "vertices" => rest
                    .first()
                    .and_then(|raw| raw.parse::<u32>().ok())
                    .map(|count| interface.vertex_count = Some(count)),
                _ => match head.strip_prefix("channel") {
                    Some(index) => parse_channel(index, &rest).map(|channel| {
                        interface
                            .channels
                            .retain(|existing| existing.channel != channel.channel);
                        interface.channels.push(channel);
                    }),
                    None => Some(()),
                },
            };
            if parsed.is_none() {
                warn!(line = line_no + 1, directive = %directive, "ignoring malformed directive");
            }
        }
        interface.channels.sort_by_key(|channel| channel.channel);
        interface
    }
}

fn parse_param(words: &[&str]) -> Option<ParamDef> {
    let (name, kind_raw) = (words.first()?, words.get(1)?);
    let (kind_name, array_size) = match kind_raw.split_once('[') {
        Some((kind, size)) => (kind, Some(size.strip_suffix(']')?.parse::<usize>().ok()?)),
        None => (*kind_raw, None),
    };
    let kind = ParamKind::parse(kind_name)?;
    let numbers = words[2..]
        .iter()
        .map(|raw| parse_number(raw))
        .collect::<Option<Vec<f32>>>()?;

    let expected = kind.component_count() * array_size.unwrap_or(1).max(1);
    let (default, range): (Vec<f32>, &[f32]) = if numbers.is_empty() {
        (vec![0.0; expected], &[])
    } else {
        if numbers.len() < expected {
            return None;
        }
        let (default, range) = numbers.split_at(expected);
        (default.to_vec(), range)
    };
    let (min, max) = match range {
        [] => (None, None),
        [min, max] => (Some(*min), Some(*max)),
        _ => return None,
    };

    Some(ParamDef {
        name: (*name).to_string(),
        kind,
        default: if expected == 1 {
            ParamValue::Scalar(default[0])
        } else {
            ParamValue::Vector(default)
        },
        min,
        max,
        array_size,
    })
}

fn parse_number(raw: &str) -> Option<f32> {
    match raw {
        "true" => Some(1.0),
        "false" => Some(0.0),
        other => other.parse::<f32>().ok(),
    }
}

fn parse_channel(index: &str, words: &[&str]) -> Option<ChannelDirective> {
    let channel = index.parse::<usize>().ok().filter(|c| *c < CHANNEL_COUNT)?;
    match words {
        ["texture", name, ..] => Some(ChannelDirective {
            channel,
            texture_name: (*name).to_string(),
            kind: ChannelKind::Texture,
            fft_size: None,
        }),
        ["audio", rest @ ..] => {
            let fft_size = match rest {
                ["fft", size, ..] => Some(size.parse::<u32>().ok()?),
                _ => None,
            };
            Some(ChannelDirective {
                channel,
                texture_name: "audio".to_string(),
                kind: ChannelKind::Audio,
                fft_size,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_params_with_ranges_and_arrays() {
        let source = "\
// @param tint color 1 0.5 0.2
// @param warp float 0.25 0 1
// @param bands float[4] 0 1 2 3
void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }
";
        let interface = CommentDirectiveParser.parse(source);

        assert_eq!(interface.params.len(), 3);
        let tint = &interface.params[0];
        assert_eq!(tint.kind, ParamKind::Color);
        assert_eq!(tint.default, ParamValue::Vector(vec![1.0, 0.5, 0.2]));

        let warp = &interface.params[1];
        assert_eq!(warp.default, ParamValue::Scalar(0.25));
        assert_eq!((warp.min, warp.max), (Some(0.0), Some(1.0)));

        let bands = &interface.params[2];
        assert_eq!(bands.array_size, Some(4));
        assert_eq!(bands.expected_len(), 4);
    }

    #[test]
    fn parses_channel_directives() {
        let source = "// @channel1 audio fft 512\n// @channel0 texture noise.png\n";
        let interface = CommentDirectiveParser.parse(source);
        assert_eq!(
            interface.channels,
            vec![
                ChannelDirective {
                    channel: 0,
                    texture_name: "noise.png".into(),
                    kind: ChannelKind::Texture,
                    fft_size: None,
                },
                ChannelDirective {
                    channel: 1,
                    texture_name: "audio".into(),
                    kind: ChannelKind::Audio,
                    fft_size: Some(512),
                },
            ]
        );
    }

    #[test]
    fn malformed_directives_are_skipped() {
        let source = "// @param broken vec3 1 2\n// @channel9 texture x.png\n// @param ok int 3\n";
        let interface = CommentDirectiveParser.parse(source);
        assert_eq!(interface.params.len(), 1);
        assert_eq!(interface.params[0].name, "ok");
        assert!(interface.channels.is_empty());
    }

    #[test]
    fn vertex_count_directive() {
        let interface = CommentDirectiveParser.parse("// @vertices 36\n");
        assert_eq!(interface.vertex_count, Some(36));
    }
}
