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

use std::borrow::Cow;
use std::fmt;

use crate::request::{render_value, Attributes};

/// A parsed policy rule. This is the top-level type in the rule grammar.
///
/// The kind of each check is decided once at parse time from the left-hand side of the check:
/// `role:...` becomes [Check::Role], `rule:...` becomes [Check::Rule], `http:...` and `https:...`
/// become [Check::Http], and everything else becomes [Check::Generic].
///
/// Check trees are immutable once built and can be shared between threads.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Check {
    /// `@` (or the empty rule) is `Const(true)`, `!` is `Const(false)`.
    Const(bool),
    /// Passes if the credentials carry the named role.
    Role(Template),
    /// Delegates to another rule within the same service.
    Rule(String),
    /// Asks a remote server. The template holds the full URL including the scheme.
    Http(Template),
    /// Compares an attribute from the credentials (or a literal) with the right-hand side.
    Generic(LeftHandSide, Template),
    /// Passes if all operands pass. `And(vec![])` always passes.
    And(Vec<Check>),
    /// Passes if any operand passes. `Or(vec![])` never passes.
    Or(Vec<Check>),
    /// Passes if the operand fails.
    Not(Box<Check>),
}

impl Check {
    /// Builds the check for `lhs:rhs`.
    pub(crate) fn from_parts(lhs: LeftHandSide, rhs: &str) -> Check {
        match lhs {
            LeftHandSide::Identifier(id) => match id.as_str() {
                "role" => Check::Role(Template::parse(rhs)),
                "rule" => Check::Rule(rhs.to_owned()),
                "http" | "https" => Check::Http(Template::parse(&format!("{id}:{rhs}"))),
                _ => Check::Generic(LeftHandSide::Identifier(id), Template::parse(rhs)),
            },
            lhs @ LeftHandSide::Literal(_) => Check::Generic(lhs, Template::parse(rhs)),
        }
    }

    /// Combines two checks with `and`, flattening nested conjunctions.
    pub(crate) fn and(lhs: Check, rhs: Check) -> Check {
        let mut operands = match lhs {
            Check::And(v) => v,
            other => vec![other],
        };
        match rhs {
            Check::And(v) => operands.extend(v),
            other => operands.push(other),
        }
        Check::And(operands)
    }

    /// Combines two checks with `or`, flattening nested disjunctions.
    pub(crate) fn or(lhs: Check, rhs: Check) -> Check {
        let mut operands = match lhs {
            Check::Or(v) => v,
            other => vec![other],
        };
        match rhs {
            Check::Or(v) => operands.extend(v),
            other => operands.push(other),
        }
        Check::Or(operands)
    }

    /// How strongly this check binds when written out: 1 for `or`, 2 for `and`, 3 for `not`, 4
    /// for anything that never needs parentheses.
    fn binding_strength(&self) -> u8 {
        match self {
            Check::Or(v) if v.len() > 1 => 1,
            Check::And(v) if v.len() > 1 => 2,
            Check::Or(v) | Check::And(v) => v.first().map_or(4, Check::binding_strength),
            Check::Not(_) => 3,
            _ => 4,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_strength: u8) -> fmt::Result {
        if self.binding_strength() < min_strength {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }

    fn fmt_joined(f: &mut fmt::Formatter<'_>, operands: &[Check], op: &str, min: u8) -> fmt::Result {
        for (idx, operand) in operands.iter().enumerate() {
            if idx > 0 {
                write!(f, " {op} ")?;
            }
            operand.fmt_operand(f, min)?;
        }
        Ok(())
    }
}

impl fmt::Display for Check {
    /// Generates the check's canonical representation in the policy language. Parsing this
    /// representation again yields a check that evaluates identically.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Check::*;
        match self {
            Const(true) => f.write_str("@"),
            Const(false) => f.write_str("!"),
            Role(t) => write!(f, "role:{t}"),
            Rule(name) => write!(f, "rule:{name}"),
            Http(t) => write!(f, "{t}"),
            Generic(lhs, rhs) => write!(f, "{lhs}:{rhs}"),
            //the identity elements have to be written as constants to survive a roundtrip
            And(v) if v.is_empty() => f.write_str("@"),
            Or(v) if v.is_empty() => f.write_str("!"),
            //`and` binds more strongly than `or`, so we need to use parentheses around an `or`
            //expression inside an `and` expression
            And(v) => Check::fmt_joined(f, v, "and", 2),
            Or(v) => Check::fmt_joined(f, v, "or", 1),
            Not(e) => {
                f.write_str("not ")?;
                e.fmt_operand(f, 3)
            }
        }
    }
}

/// Helper for quickly constructing [Check] literals.
impl From<bool> for Check {
    fn from(x: bool) -> Check {
        Check::Const(x)
    }
}

/// The left-hand side of a generic check.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum LeftHandSide {
    /// A quoted string, `True`, `False` or an integer. Compared directly with the right-hand side.
    Literal(String),
    /// The (dotted) name of a credential attribute.
    Identifier(String),
}

impl fmt::Display for LeftHandSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use LeftHandSide::*;
        match self {
            Literal(s) => write!(f, "'{s}'"),
            Identifier(s) => f.write_str(s),
        }
    }
}

/// A value that may reference target attributes with the `%(dotted.path)s` syntax.
///
/// Quoted values (`'foo'` or `"foo"`) are taken literally.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

#[derive(PartialEq, Eq, Clone, Debug)]
enum Segment {
    Text(String),
    Attribute(String),
}

/// Returned by [Template::render] when a referenced target attribute does not exist (or does not
/// have a scalar value).
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Unresolved {
    /// The dotted path that could not be resolved.
    pub path: String,
}

impl Template {
    /// Splits `source` into literal text and attribute references.
    pub fn parse(source: &str) -> Template {
        let source = source.to_owned();
        if let Some(quoted) = strip_quotes(&source) {
            let segments = vec![Segment::Text(quoted.to_owned())];
            return Template { source, segments };
        }

        let mut segments = Vec::new();
        let mut rest = source.as_str();
        while let Some(start) = rest.find("%(") {
            let Some(len) = rest[start + 2..].find(")s") else {
                break;
            };
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_owned()));
            }
            let path = &rest[start + 2..start + 2 + len];
            segments.push(Segment::Attribute(path.to_owned()));
            rest = &rest[start + 2 + len + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_owned()));
        }
        Template { source, segments }
    }

    /// Returns the template as written in the rule.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Expands all attribute references against `target`.
    pub fn render<'a>(&'a self, target: &'a Attributes) -> Result<Cow<'a, str>, Unresolved> {
        let resolve = |path: &str| {
            target
                .lookup(path)
                .and_then(render_value)
                .ok_or_else(|| Unresolved {
                    path: path.to_owned(),
                })
        };
        match self.segments.as_slice() {
            [] => Ok(Cow::Borrowed("")),
            [Segment::Text(text)] => Ok(Cow::Borrowed(text)),
            [Segment::Attribute(path)] => resolve(path),
            segments => {
                let mut result = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => result.push_str(text),
                        Segment::Attribute(path) => result.push_str(&resolve(path)?),
                    }
                }
                Ok(Cow::Owned(result))
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn strip_quotes(s: &str) -> Option<&str> {
    ['\'', '"'].into_iter().find_map(|quote| {
        s.strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
    })
}


#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;
    use serde_json::json;

    //The serialization is used for dumping rule stores, so it must parse back into an
    //equivalent check.
    #[test]
    fn test_serialization() {
        let expr = make_and(true, false);
        assert_eq!(expr.to_string(), "@ and !");

        let expr = make_or(true, false);
        assert_eq!(expr.to_string(), "@ or !");

        let expr = make_or(true, make_or(false, make_not(true)));
        assert_eq!(expr.to_string(), "@ or ! or not @");
        let expr = make_or(make_or(true, false), make_not(true));
        assert_eq!(expr.to_string(), "@ or ! or not @");

        let expr = make_or(true, make_and(false, make_not(true)));
        assert_eq!(expr.to_string(), "@ or ! and not @");

        let expr = make_or(make_and(true, false), make_not(true));
        assert_eq!(expr.to_string(), "@ and ! or not @");

        let expr = make_and(true, make_and(false, make_not(true)));
        assert_eq!(expr.to_string(), "@ and ! and not @");

        let expr = make_and(true, make_or(false, make_not(true)));
        assert_eq!(expr.to_string(), "@ and (! or not @)");

        let expr = make_and(make_or(true, false), make_not(true));
        assert_eq!(expr.to_string(), "(@ or !) and not @");

        //unlike the and/or case, `not` needs parentheses around any compound operand
        let expr = make_not(make_and(true, false));
        assert_eq!(expr.to_string(), "not (@ and !)");
        let expr = make_not(make_not(true));
        assert_eq!(expr.to_string(), "not not @");
    }

    #[test]
    fn test_serialization_of_degenerate_combinators() {
        assert_eq!(Check::And(vec![]).to_string(), "@");
        assert_eq!(Check::Or(vec![]).to_string(), "!");
        let single = Check::Or(vec![make_and(make_role("a"), make_role("b"))]);
        assert_eq!(make_not(single).to_string(), "not (role:a and role:b)");
    }

    #[test]
    fn test_check_kinds() {
        assert_eq!(make_check("role", "admin"), make_role("admin"));
        assert_eq!(
            make_check("rule", "admin_required"),
            Check::Rule("admin_required".into())
        );
        let http = make_check("http", "//server.test/%(name)s");
        assert_eq!(http.to_string(), "http://server.test/%(name)s");
        assert!(matches!(http, Check::Http(_)));
        assert!(matches!(make_check("https", "//x"), Check::Http(_)));
        assert!(matches!(
            make_check("user_id", "%(user.id)s"),
            Check::Generic(..)
        ));
    }

    #[test]
    fn test_template_rendering() {
        let target = Attributes::from_value(json!({
            "obj": {"user": {"id": "u-1", "enabled": true, "age": 42}},
            "target.project_id": "p-1",
            "nothing": null,
        }))
        .unwrap();

        let render = |s: &str| {
            Template::parse(s)
                .render(&target)
                .map(|r| r.into_owned())
        };
        assert_eq!(render("%(obj.user.id)s"), Ok("u-1".into()));
        assert_eq!(render("%(obj.user.enabled)s"), Ok("True".into()));
        assert_eq!(render("%(obj.user.age)s"), Ok("42".into()));
        assert_eq!(render("%(target.project_id)s"), Ok("p-1".into()));
        assert_eq!(render("plain"), Ok("plain".into()));
        assert_eq!(
            render("//host/%(obj.user.id)s/%(target.project_id)s"),
            Ok("//host/u-1/p-1".into())
        );
        assert_eq!(render("'%(obj.user.id)s'"), Ok("%(obj.user.id)s".into()));
        assert_eq!(render("\"quoted\""), Ok("quoted".into()));
        //an unterminated reference is just text
        assert_eq!(render("%(obj"), Ok("%(obj".into()));

        for path in ["obj.group.id", "nothing", "obj.user"] {
            let input = format!("%({path})s");
            assert_eq!(
                render(&input),
                Err(Unresolved { path: path.into() }),
                "input was: {input}"
            );
        }
    }
}
