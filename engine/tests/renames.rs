// Renaming free identifiers in formula text.

use std::collections::HashMap;

use calcgraph::Compilation;

fn rename(source: &str, pairs: &[(&str, &str)]) -> String {
    let renames: HashMap<String, String> = pairs
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();
    Compilation::new(source).unwrap().renamed(&renames)
}

#[test]
fn free_identifiers_are_renamed() {
    assert_eq!(rename("a + b * a", &[("a", "x")]), "x + b * x");
    assert_eq!(rename("f(a)(b)", &[("f", "g"), ("b", "c")]), "g(a)(c)");
}

#[test]
fn bound_names_are_left_alone() {
    assert_eq!(rename("x => x + y", &[("x", "q"), ("y", "r")]), "x => x + r");
    assert_eq!(
        rename("a => (b = a) => [a, b, c]", &[("a", "z"), ("b", "z"), ("c", "z")]),
        "a => (b = a) => [a, b, z]"
    );
}

#[test]
fn shadowing_is_scoped_to_the_arrow() {
    assert_eq!(
        rename("[x, (x => x)(1), x]", &[("x", "w")]),
        "[w, (x => x)(1), w]"
    );
}

#[test]
fn property_names_are_not_identifiers() {
    assert_eq!(rename("a.b + a[b]", &[("a", "d"), ("b", "e")]), "d.b + d[e]");
    assert_eq!(rename("({b: a})", &[("a", "d"), ("b", "e")]), "({b: d})");
}

#[test]
fn shorthand_properties_keep_their_key() {
    assert_eq!(rename("({y}).y", &[("y", "q")]), "({y:q}).y");
}

#[test]
fn template_holes_are_renamed() {
    assert_eq!(rename("`${a} and ${b}`", &[("a", "first")]), "`${first} and ${b}`");
}

#[test]
fn globals_and_forms_are_never_renamed() {
    assert_eq!(
        rename("Math.max(a, NaN) + try(b)", &[("Math", "M"), ("try", "t"), ("a", "x")]),
        "Math.max(x, NaN) + try(b)"
    );
}

#[test]
fn unlisted_names_and_whitespace_are_preserved() {
    let source = "  a  +\n  b  ";
    assert_eq!(rename(source, &[("b", "c")]), "a  +\n  c");
}
