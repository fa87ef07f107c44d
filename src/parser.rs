/******************************************************************************
*
*  Copyright 2023 Stefan Majewsky <majewsky@gmx.net>
*
*  Licensed under the Apache License, Version 2.0 (the "License");
*  you may not use this file except in compliance with the License.
*  You may obtain a copy of the License at
*
*      http://www.apache.org/licenses/LICENSE-2.0
*
*  Unless required by applicable law or agreed to in writing, software
*  distributed under the License is distributed on an "AS IS" BASIS,
*  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*  See the License for the specific language governing permissions and
*  limitations under the License.
*
******************************************************************************/

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::{Check, LeftHandSide};

peg::parser! {
    grammar policy_parser() for str {
        rule _ = [' ' | '\t' | '\n' | '\r']*

        // Keywords and the constants `@` and `!` must not run into the following token, otherwise
        // `orange:x` would read as `or` followed by `ange:x`.
        rule word_end() = ![^' ' | '\t' | '\n' | '\r' | '(' | ')']

        pub rule expr() -> Check
            = quiet!{_ e:expr_inner() _ { e }}
            / expected!("expression")

        rule expr_inner() -> Check = precedence!{
            x:(@) _ "or" word_end() _ y:@ { Check::or(x, y) }
            --
            x:(@) _ "and" word_end() _ y:@ { Check::and(x, y) }
            --
            "not" word_end() _ e:@ { Check::Not(Box::new(e)) }
            e:atom() { e }
        }

        rule atom() -> Check
            = quiet!{_ c:atom_inner() _ { c }}
            / expected!("check or opening parenthesis")

        rule atom_inner() -> Check
            = "(" e:expr() ")" { e }
            / c:constant() { c }
            / c:check() { c }

        rule constant() -> Check
            = "@" word_end() { Check::Const(true) }
            / "!" word_end() { Check::Const(false) }

        // A single check without any boolean syntax, as used in the list-of-lists form.
        pub rule single_check() -> Check
            = quiet!{_ c:(constant() / check()) _ { c }}
            / expected!("check")

        rule check() -> Check
            = l:check_lhs() ":" r:check_rhs() { Check::from_parts(l, &r) }

        // oslo.policy tokenizes by splitting on whitespace and recognizes
        // leading "(" and trailing ")" on each token. From this follows that checks cannot contain
        // whitespace, even if they contain quoted strings. The rule 'foo':%(bar)s works as
        // expected, but 'foo foo':%(bar)s does not. We mimic this behavior here.
        rule check_lhs() -> LeftHandSide
            = "'"  s:check_lhs_inner() "'"  { LeftHandSide::Literal(s) }
            / "\"" s:check_lhs_inner() "\"" { LeftHandSide::Literal(s) }
            /      s:check_lhs_inner()      { classify_lhs(s) }
        // We forbid:
        // - whitespace and parentheses in any part of the check (as explained above)
        // - colons on the LHS (the first colon in the check splits LHS and RHS)
        // - quotes and backslashes on the LHS (we only support simple string literals without
        //   escape sequences)
        rule check_lhs_inner() -> String
            = s:$([^' ' | '\t' | '\n' | '\r' | ':' | '\'' | '"' | '\\' | '(' | ')']+) { s.to_owned() }
        rule check_rhs() -> String
            = s:$(rhs_piece()+) { s.to_owned() }
        // Parentheses on the RHS are only allowed as part of a %(foo)s reference.
        rule rhs_piece()
            = "%(" [^')' | ' ' | '\t' | '\n' | '\r']+ ")"
            / [^' ' | '\t' | '\n' | '\r' | '(' | ')']
    }
}

/// Bare `True`, `False` and integers on the LHS are literals, not attribute names.
fn classify_lhs(s: String) -> LeftHandSide {
    let digits = s.strip_prefix('-').unwrap_or(&s);
    let is_number = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    if is_number || s == "True" || s == "False" {
        LeftHandSide::Literal(s)
    } else {
        LeftHandSide::Identifier(s)
    }
}

// The policy_parser module is private, so we need to expose an explicit interface to the outside.
type InternalParseError = peg::error::ParseError<peg::str::LineCol>;

/// Error type returned by [parse_rule] and [parse_list_rule].
///
/// This type hides the internal error type that the policy language parser returns.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct SyntaxError(InternalParseError);

/// Parses a rule written in the policy language. An empty (or all-whitespace) rule always passes.
pub fn parse_rule(input: &str) -> Result<Check, SyntaxError> {
    if input.trim().is_empty() {
        return Ok(Check::Const(true));
    }
    policy_parser::expr(input).map_err(SyntaxError)
}

/// Parses a rule in the legacy list-of-lists form. Each inner list is a conjunction of single
/// checks, and the outer list is a disjunction of those conjunctions.
///
/// An empty outer list always passes. Empty inner lists are skipped; if no non-empty inner lists
/// remain, the rule never passes.
pub fn parse_list_rule<S: AsRef<str>>(groups: &[Vec<S>]) -> Result<Check, SyntaxError> {
    if groups.is_empty() {
        return Ok(Check::Const(true));
    }
    let mut alternatives = Vec::with_capacity(groups.len());
    for group in groups.iter().filter(|g| !g.is_empty()) {
        let mut checks = group
            .iter()
            .map(|s| policy_parser::single_check(s.as_ref()).map_err(SyntaxError))
            .collect::<Result<Vec<_>, _>>()?;
        alternatives.push(if checks.len() == 1 {
            checks.remove(0)
        } else {
            Check::And(checks)
        });
    }
    Ok(match alternatives.len() {
        0 => Check::Const(false),
        1 => alternatives.remove(0),
        _ => Check::Or(alternatives),
    })
}

/// The serialized form of a single rule, as it appears in rule tables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RuleText {
    /// A rule in the policy language.
    Expression(String),
    /// A rule in the list-of-lists form. An inner entry may also be a single string.
    Legacy(Vec<LegacyGroup>),
}

/// One alternative in the list-of-lists form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum LegacyGroup {
    Single(String),
    All(Vec<String>),
}

impl RuleText {
    pub fn parse(&self) -> Result<Check, SyntaxError> {
        match self {
            RuleText::Expression(s) => parse_rule(s),
            RuleText::Legacy(groups) => {
                let groups: Vec<Vec<&str>> = groups
                    .iter()
                    .map(|g| match g {
                        LegacyGroup::Single(s) => vec![s.as_str()],
                        LegacyGroup::All(v) => v.iter().map(String::as_str).collect(),
                    })
                    .collect();
                parse_list_rule(&groups)
            }
        }
    }
}

impl From<&str> for RuleText {
    fn from(s: &str) -> Self {
        RuleText::Expression(s.to_owned())
    }
}

impl From<String> for RuleText {
    fn from(s: String) -> Self {
        RuleText::Expression(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::build::*;
    use crate::check::Template;

    //Several of these tests are adapted from the oslo.policy test suite.

    #[test]
    fn test_basic() {
        assert_eq!(parse_rule("@ and !"), Ok(make_and(true, false)));
        assert_eq!(parse_rule("    @    or   !  "), Ok(make_or(true, false)));
        assert_eq!(parse_rule(""), Ok(Check::Const(true)));
        assert_eq!(parse_rule("  \t "), Ok(Check::Const(true)));
    }

    fn assert_all_identical(inputs: &[&'static str]) {
        let expr0 = parse_rule(inputs[0]);
        assert!(expr0.is_ok(), "input was {:?}", inputs[0]);
        for input in inputs.iter() {
            let expr = parse_rule(input);
            assert_eq!(
                expr, expr0,
                "left input was {:?}, right input was {:?}",
                input, inputs[0]
            );
        }
    }

    #[test]
    fn test_all_identical() {
        assert_all_identical(&[
            "( @ ) and ! or @",
            "@ and ( ! ) or @",
            "@ and ! or ( @ )",
            "( @ ) and ! or ( @ )",
            "@ and ( ! ) or ( @ )",
            "( @ ) and ( ! ) or ( @ )",
            "( @ and ! ) or @",
            "( ( @ ) and ! ) or @",
            "( @ and ( ! ) ) or @",
            "( ( @ and ! ) ) or @",
            "( @ and ! or @ )",
            "(@ and !) or @",
        ]);
        assert_all_identical(&[
            "not ( @ ) and ! or @",
            "not @ and ( ! ) or @",
            "not @ and ! or ( @ )",
            "( not @ ) and ! or @",
            "( not @ and ! ) or @",
            "( not @ and ! or @ )",
            "not(@) and ! or @",
        ]);
        assert_all_identical(&[
            "( @ ) and not ! or @",
            "@ and ( not ! ) or @",
            "@ and not ( ! ) or @",
            "@ and not ! or ( @ )",
            "( @ and not ! ) or @",
            "( @ and not ! or @ )",
        ]);
        assert_all_identical(&[
            "( @ ) and ! or not @",
            "@ and ( ! ) or not @",
            "@ and ! or not ( @ )",
            "@ and ! or ( not @ )",
            "( @ and ! ) or not @",
            "( @ and ! or not @ )",
        ]);
    }

    #[test]
    fn test_parsing_of_checks() {
        //test success cases
        let input = "user_id:%(target.user_id)s and role:compute:get_all";
        let lhs = make_check("user_id", "%(target.user_id)s");
        let rhs = make_role("compute:get_all");
        let parsed = parse_rule(input);
        assert_eq!(parsed, Ok(make_and(lhs, rhs)));
        assert_eq!(parsed.unwrap().to_string(), input);

        //test more success cases
        let input = "is_admin:True or 'Member':%(role.name)s";
        let lhs = make_check("is_admin", "True");
        let rhs = make_literal_check("Member", "%(role.name)s");
        let parsed = parse_rule(input);
        assert_eq!(parsed, Ok(make_or(lhs, rhs)));
        assert_eq!(parsed.unwrap().to_string(), input);

        //test more success cases
        let input = "\"Member\":%(role.name)s";
        let check = make_literal_check("Member", "%(role.name)s");
        let parsed = parse_rule(input);
        assert_eq!(parsed, Ok(check));
        //This does not roundtrip back into `input` because serialization uses single quotes.
        assert_eq!(parsed.unwrap().to_string(), "'Member':%(role.name)s");

        //bare booleans and numbers on the LHS are literals
        let parsed = parse_rule("True:%(user.enabled)s");
        assert_eq!(parsed, Ok(make_literal_check("True", "%(user.enabled)s")));
        let parsed = parse_rule("20:%(domain.id)s");
        assert_eq!(parsed, Ok(make_literal_check("20", "%(domain.id)s")));

        //checks directly inside parentheses
        let parsed = parse_rule("(role:admin or rule:owner) and not project_id:%(project.id)s");
        let expected = make_and(
            make_or(make_role("admin"), Check::Rule("owner".into())),
            make_not(make_check("project_id", "%(project.id)s")),
        );
        assert_eq!(parsed, Ok(expected));

        //HTTP checks keep their scheme
        let parsed = parse_rule("http://server.test/%(name)s or https://other.test");
        let expected = make_or(
            Check::Http(Template::parse("http://server.test/%(name)s")),
            Check::Http(Template::parse("https://other.test")),
        );
        assert_eq!(parsed, Ok(expected));

        //keywords are only recognized as whole words
        let parsed = parse_rule("notify:yes and orange:%(fruit)s");
        let expected = make_and(
            make_check("notify", "yes"),
            make_check("orange", "%(fruit)s"),
        );
        assert_eq!(parsed, Ok(expected));
    }

    #[test]
    fn test_parse_errors() {
        let inputs = [
            //whitespace in check is not allowed (compatibility with oslo.policy)
            "'foo bar':%(role.name)s",
            //unbalanced parentheses
            "(role:admin",
            "role:admin)",
            "((@) or !",
            //dangling operators
            "role:admin and",
            "or role:admin",
            "role:admin or or role:member",
            "not",
            //missing operator between checks
            "role:admin role:member",
            "@@",
            //incomplete checks
            "role:",
            ":admin",
            "admin",
        ];
        for input in inputs {
            assert!(parse_rule(input).is_err(), "input was: {input:?}");
        }

        //escape sequences in literals are not allowed (not needed so far)
        for escape_sequence in ["\\n", "\\\\", "\\\"", "\\'"] {
            let input = format!("'foo{escape_sequence}bar':%(role.name)s");
            assert!(parse_rule(&input).is_err(), "input was: {input:?}");
        }
    }

    #[test]
    fn test_roundtrip() {
        let inputs = [
            "role:admin or (project_id:%(project_id)s and role:projectadmin)",
            "project_id:%(project_id)s and not role:dunce",
            "not (role:a or role:b) and rule:c",
            "(role:a or role:b) and (role:c or role:d)",
            "http://server.test/%(name)s",
            "'Member':%(role.name)s",
            "user_id:'xpto2035abc'",
        ];
        for input in inputs {
            let parsed = parse_rule(input).unwrap();
            let reparsed = parse_rule(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "input was: {input:?}");
        }
    }

    #[test]
    fn test_list_rules() {
        let groups = vec![
            vec!["role:admin"],
            vec!["project_id:%(project_id)s", "role:projectadmin"],
        ];
        let expected = parse_rule("role:admin or (project_id:%(project_id)s and role:projectadmin)");
        assert_eq!(parse_list_rule(&groups), expected);

        let empty: Vec<Vec<&str>> = vec![];
        assert_eq!(parse_list_rule(&empty), Ok(Check::Const(true)));
        let only_empty_groups: Vec<Vec<&str>> = vec![vec![], vec![]];
        assert_eq!(parse_list_rule(&only_empty_groups), Ok(Check::Const(false)));
        assert_eq!(parse_list_rule(&[vec!["!"]]), Ok(Check::Const(false)));

        //inner entries are single checks, not expressions
        assert!(parse_list_rule(&[vec!["role:a or role:b"]]).is_err());
        assert!(parse_list_rule(&[vec!["not role:a"]]).is_err());
    }

    #[test]
    fn test_rule_text_deserialization() {
        let text: RuleText = serde_json::from_str(r#""role:admin""#).unwrap();
        assert_eq!(text.parse(), Ok(make_role("admin")));

        let text: RuleText =
            serde_json::from_str(r#"[["role:admin"], "role:member", []]"#).unwrap();
        assert_eq!(
            text.parse(),
            Ok(make_or(make_role("admin"), make_role("member")))
        );
    }
}
