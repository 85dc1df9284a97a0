//! Rule Encoder.
//!
//! Renders a desired attribute set as the argument string the filter CLI
//! expects after its insert or replace verb. Attributes are emitted in the
//! registry's canonical order so that a rule rendered twice, or read back
//! from the dump, always produces the same text.

use crate::error::{RuleError, RuleResult};
use crate::schema::{Arity, AttributeSpec, Form, Negation, Schema, Switch, ValueKind};
use crate::tokenizer::{quote_if_needed, single_quote};
use crate::types::{AttrValue, DesiredRuleSpec, Family, Operand};

/// Accumulates arguments and remembers which modules were introduced.
#[derive(Debug, Default)]
struct ArgWriter {
    args: Vec<String>,
    introduced: Vec<&'static str>,
}

impl ArgWriter {
    fn introduce(&mut self, module: Option<&'static str>, every_time: bool) {
        if let Some(module) = module {
            if every_time || !self.introduced.contains(&module) {
                self.args.push("-m".to_string());
                self.args.push(module.to_string());
                self.introduced.push(module);
            }
        }
    }

    fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    fn finish(self) -> String {
        self.args.join(" ")
    }
}

/// Encoder bound to a schema registry.
#[derive(Debug, Clone, Copy)]
pub struct RuleEncoder<'a> {
    schema: &'a Schema,
}

impl Default for RuleEncoder<'static> {
    fn default() -> Self {
        Self::new(Schema::standard())
    }
}

impl<'a> RuleEncoder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Renders `CHAIN POSITION ARGS` for an insert or replace.
    pub fn render(&self, spec: &DesiredRuleSpec, position: usize) -> RuleResult<String> {
        let args = self.render_args(spec)?;
        if args.is_empty() {
            Ok(format!("{} {}", spec.chain, position))
        } else {
            Ok(format!("{} {} {}", spec.chain, position, args))
        }
    }

    /// Renders only the match and target arguments.
    pub fn render_args(&self, spec: &DesiredRuleSpec) -> RuleResult<String> {
        for name in spec.attributes.names() {
            self.schema.require(name)?;
        }

        let mut writer = ArgWriter::default();
        for attr in self.schema.ordered_attributes() {
            if attr.name == "name" {
                if !spec.name.is_empty() {
                    let comment = AttrValue::one(spec.name.clone());
                    self.render_attr(&mut writer, attr, &comment, spec.family)?;
                }
                continue;
            }
            let Some(value) = spec.attributes.get(attr.name) else {
                continue;
            };
            if is_default(attr, value) {
                continue;
            }
            attr.check_family(spec.family)?;
            self.render_attr(&mut writer, attr, value, spec.family)?;
        }
        Ok(writer.finish())
    }

    fn render_attr(
        &self,
        writer: &mut ArgWriter,
        attr: &AttributeSpec,
        value: &AttrValue,
        family: Family,
    ) -> RuleResult<()> {
        match attr.form {
            Form::Simple(sw) => render_switch(writer, attr, sw, value),
            Form::Dual { single, multi } => {
                let sw = if value.is_list() { multi } else { single };
                render_switch(writer, attr, sw, value)
            }
            Form::PerFamily { v4, v6 } => {
                let sw = match family {
                    Family::V4 => v4,
                    Family::V6 => v6,
                };
                render_switch(writer, attr, sw, value)
            }
            Form::Choice { module, .. } => {
                for op in value.operands() {
                    writer.introduce(Some(module), false);
                    if op.negated {
                        writer.push("!");
                    }
                    writer.push(format!("--{}", op.text));
                }
                Ok(())
            }
            Form::ModuleOnly(module) => match value {
                AttrValue::Present { negated: false } => {
                    writer.introduce(Some(module), false);
                    Ok(())
                }
                _ => Err(RuleError::invalid_value(
                    attr.name,
                    "module match cannot be negated or carry a value",
                )),
            },
        }
    }
}

fn is_default(attr: &AttributeSpec, value: &AttrValue) -> bool {
    match (attr.default, value) {
        (Some(default), AttrValue::One(op)) => !op.negated && op.text == default,
        _ => false,
    }
}

fn render_switch(
    writer: &mut ArgWriter,
    attr: &AttributeSpec,
    sw: Switch,
    value: &AttrValue,
) -> RuleResult<()> {
    if attr.kind == ValueKind::Presence {
        let AttrValue::Present { negated } = value else {
            return Err(RuleError::invalid_value(attr.name, "takes no value"));
        };
        writer.introduce(sw.module, false);
        if *negated {
            writer.push("!");
        }
        writer.push(sw.flag);
        return Ok(());
    }

    if attr.arity == Arity::Repeated {
        for op in value.operands() {
            writer.introduce(sw.module, true);
            push_flag_and_value(writer, attr, sw, op.negated, format_operand(attr, op));
        }
        return Ok(());
    }

    let (negated, text) = match value {
        AttrValue::Present { .. } => {
            return Err(RuleError::invalid_value(attr.name, "requires a value"))
        }
        AttrValue::One(op) => (op.negated, format_operand(attr, op)),
        AttrValue::Many(ops) => {
            let negated = ops.first().map(|op| op.negated).unwrap_or(false);
            let parts: Vec<String> = ops.iter().map(|op| format_operand(attr, op)).collect();
            (negated, parts.join(","))
        }
    };
    writer.introduce(sw.module, false);
    push_flag_and_value(writer, attr, sw, negated, text);
    Ok(())
}

fn push_flag_and_value(
    writer: &mut ArgWriter,
    attr: &AttributeSpec,
    sw: Switch,
    negated: bool,
    text: String,
) {
    match (negated, attr.negation) {
        (true, Negation::BeforeFlag) => {
            writer.push("!");
            writer.push(sw.flag);
        }
        (true, Negation::AfterFlag) => {
            writer.push(sw.flag);
            writer.push("!");
        }
        (false, _) => writer.push(sw.flag),
    }
    writer.push(text);
}

fn format_operand(attr: &AttributeSpec, op: &Operand) -> String {
    let text = op.text.as_str();
    match attr.kind {
        ValueKind::Quoted => single_quote(text),
        ValueKind::Port => quote_if_needed(&port_range(text)),
        ValueKind::Pair => text
            .split_whitespace()
            .map(quote_if_needed)
            .collect::<Vec<_>>()
            .join(" "),
        _ => quote_if_needed(text),
    }
}

/// Rewrites a numeric `lo-hi` port range into the `lo:hi` form the CLI takes.
pub fn port_range(text: &str) -> String {
    match text.split_once('-') {
        Some((lo, hi))
            if !lo.is_empty()
                && !hi.is_empty()
                && lo.chars().all(|c| c.is_ascii_digit())
                && hi.chars().all(|c| c.is_ascii_digit()) =>
        {
            format!("{lo}:{hi}")
        }
        _ => text.to_string(),
    }
}

/// Renders with the standard registry.
pub fn render(spec: &DesiredRuleSpec, position: usize) -> RuleResult<String> {
    RuleEncoder::default().render(spec, position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RuleDecoder;
    use crate::types::AttributeMap;
    use pretty_assertions::assert_eq;

    fn spec(name: &str, attributes: AttributeMap) -> DesiredRuleSpec {
        DesiredRuleSpec {
            attributes,
            ..DesiredRuleSpec::new(name)
        }
    }

    #[test]
    fn test_render_basic() {
        let s = spec(
            "100 allow ssh",
            AttributeMap::new()
                .with("proto", AttrValue::one("tcp"))
                .with("dport", AttrValue::many(["22"]))
                .with("jump", AttrValue::one("ACCEPT")),
        );
        assert_eq!(
            render(&s, 1).unwrap(),
            "INPUT 1 -p tcp -m multiport --dports 22 -m comment --comment '100 allow ssh' -j ACCEPT"
        );
    }

    #[test]
    fn test_render_negation_placement() {
        let s = spec(
            "200 block",
            AttributeMap::new()
                .with("source", AttrValue::One(Operand::negated("10.0.0.0/8")))
                .with("proto", AttrValue::one("tcp"))
                .with("dport", AttrValue::many(["! 80", "443"]))
                .with("state", AttrValue::many(["! INVALID"]))
                .with("jump", AttrValue::one("DROP")),
        );
        assert_eq!(
            render(&s, 3).unwrap(),
            "INPUT 3 ! -s 10.0.0.0/8 -p tcp -m multiport --dports ! 80,443 \
             -m state ! --state INVALID -m comment --comment '200 block' -j DROP"
        );
    }

    #[test]
    fn test_render_shared_and_repeated_modules() {
        let s = spec(
            "300 ports",
            AttributeMap::new()
                .with("proto", AttrValue::one("udp"))
                .with("sport", AttrValue::many(["1024-65535"]))
                .with("dport", AttrValue::many(["53", "123"]))
                .with("src_type", AttrValue::many(["LOCAL", "! BROADCAST"]))
                .with("jump", AttrValue::one("ACCEPT")),
        );
        assert_eq!(
            render(&s, 1).unwrap(),
            "INPUT 1 -p udp -m multiport --sports 1024:65535 --dports 53,123 \
             -m addrtype --src-type LOCAL -m addrtype --src-type ! BROADCAST \
             -m comment --comment '300 ports' -j ACCEPT"
        );
    }

    #[test]
    fn test_render_single_port_form() {
        let s = spec(
            "310 one port",
            AttributeMap::new()
                .with("proto", AttrValue::one("tcp"))
                .with("dport", AttrValue::one("8080")),
        );
        assert_eq!(
            render(&s, 2).unwrap(),
            "INPUT 2 -p tcp --dport 8080 -m comment --comment '310 one port'"
        );
    }

    #[test]
    fn test_render_presence_and_target_options() {
        let s = spec(
            "400 log",
            AttributeMap::new()
                .with("isfragment", AttrValue::Present { negated: true })
                .with("jump", AttrValue::one("LOG"))
                .with("log_prefix", AttrValue::one("it's dropped: "))
                .with("log_level", AttrValue::one("warning"))
                .with("log_uid", AttrValue::Present { negated: false }),
        );
        assert_eq!(
            render(&s, 1).unwrap(),
            r"INPUT 1 ! -f -m comment --comment '400 log' -j LOG --log-prefix 'it'\''s dropped: ' --log-level warning --log-uid"
        );
    }

    #[test]
    fn test_render_per_family_switch() {
        let mut s = spec(
            "500 ping",
            AttributeMap::new()
                .with("proto", AttrValue::one("ipv6-icmp"))
                .with("icmp", AttrValue::one("echo-request"))
                .with("hop_limit", AttrValue::one("255")),
        );
        s.family = Family::V6;
        assert_eq!(
            render(&s, 1).unwrap(),
            "INPUT 1 -p ipv6-icmp -m icmp6 --icmpv6-type echo-request -m hl --hl-eq 255 \
             -m comment --comment '500 ping'"
        );

        s.family = Family::V4;
        assert!(matches!(
            render(&s, 1),
            Err(RuleError::InvalidValue { attribute, .. }) if attribute == "hop_limit"
        ));
    }

    #[test]
    fn test_render_choice_and_module_only() {
        let s = spec(
            "600 recent",
            AttributeMap::new()
                .with("socket", AttrValue::Present { negated: false })
                .with("recent", AttrValue::one("update"))
                .with("rseconds", AttrValue::one("60"))
                .with("rname", AttrValue::one("SSH"))
                .with("jump", AttrValue::one("DROP")),
        );
        assert_eq!(
            render(&s, 1).unwrap(),
            "INPUT 1 -m socket -m recent --update --seconds 60 --name SSH \
             -m comment --comment '600 recent' -j DROP"
        );
    }

    #[test]
    fn test_render_omits_default_proto() {
        let s = spec(
            "700 all",
            AttributeMap::new()
                .with("proto", AttrValue::one("all"))
                .with("jump", AttrValue::one("ACCEPT")),
        );
        assert_eq!(render(&s, 1).unwrap(), "INPUT 1 -m comment --comment '700 all' -j ACCEPT");
    }

    #[test]
    fn test_render_unknown_attribute() {
        let s = spec("800 x", AttributeMap::new().with("frobnicate", AttrValue::one("1")));
        assert!(matches!(render(&s, 1), Err(RuleError::UnknownAttribute { .. })));
    }

    #[test]
    fn test_port_range() {
        assert_eq!(port_range("1024-65535"), "1024:65535");
        assert_eq!(port_range("netbios-ns"), "netbios-ns");
        assert_eq!(port_range("22"), "22");
    }

    #[test]
    fn test_render_reparses_to_same_attributes() {
        let s = spec(
            "900 everything",
            AttributeMap::new()
                .with("source", AttrValue::one("192.168.0.0/16"))
                .with("iniface", AttrValue::one("eth0"))
                .with("proto", AttrValue::one("tcp"))
                .with("tcp_flags", AttrValue::one("FIN,SYN,RST,ACK SYN"))
                .with("dport", AttrValue::many(["! 22", "80"]))
                .with("ctstate", AttrValue::many(["NEW", "ESTABLISHED"]))
                .with("ipset", AttrValue::many(["blocked src", "! allowed dst"]))
                .with("string", AttrValue::one("GET /admin"))
                .with("match_mark", AttrValue::One(Operand::negated("0x1")))
                .with("jump", AttrValue::one("MARK"))
                .with("set_mark", AttrValue::one("0x2a/0xffffffff")),
        );
        let rendered = RuleEncoder::default().render_args(&s).unwrap();
        let line = format!("-A INPUT {rendered}");
        let decoded = RuleDecoder::default()
            .decode_line(&line, "filter", Family::V4, 1)
            .unwrap();
        assert_eq!(decoded.name, "900 everything");
        assert_eq!(decoded.attributes, s.attributes);
    }
}
