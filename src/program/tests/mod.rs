//! Entry-point validation tests

use super::*;

fn main_method() -> MethodDef {
    MethodDef::new("main").with_body(Box::new(|_| {}))
}

#[test]
fn test_well_formed_main() {
    let program = Program::new().with_item(
        ClassDef::new("Main", ItemKind::Class).with_method(main_method()),
    );
    let entry = program.entry_point().unwrap();
    assert_eq!(entry.name(), "Main.main");
}

#[test]
fn test_missing_main_class() {
    let program = Program::new().with_item(
        ClassDef::new("Helper", ItemKind::Class).with_method(main_method()),
    );
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::MissingMainClass)
    ));
}

#[test]
fn test_main_not_a_class() {
    let program = Program::new().with_item(
        ClassDef::new("Main", ItemKind::Interface).with_method(main_method()),
    );
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::MainNotAClass(ItemKind::Interface))
    ));
}

#[test]
fn test_generic_main_class() {
    let mut class = ClassDef::new("Main", ItemKind::Class).with_method(main_method());
    class.type_params = 1;
    let program = Program::new().with_item(class);
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::GenericMainClass)
    ));
}

#[test]
fn test_missing_main_method() {
    let program = Program::new().with_item(
        ClassDef::new("Main", ItemKind::Class)
            .with_method(MethodDef::new("run").with_body(Box::new(|_| {}))),
    );
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::MissingMainMethod)
    ));
}

#[test]
fn test_generic_main_method() {
    let mut method = main_method();
    method.type_params = 2;
    let program =
        Program::new().with_item(ClassDef::new("Main", ItemKind::Class).with_method(method));
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::GenericMainMethod)
    ));
}

#[test]
fn test_malformed_signature() {
    let mut method = main_method();
    method.params = 2;
    method.returns_unit = false;
    let program =
        Program::new().with_item(ClassDef::new("Main", ItemKind::Class).with_method(method));
    match program.entry_point() {
        Err(EntryPointError::MalformedSignature {
            params,
            returns_unit,
        }) => {
            assert_eq!(params, 2);
            assert!(!returns_unit);
        }
        other => panic!("expected malformed-signature diagnostic, got {other:?}"),
    }
}

#[test]
fn test_missing_main_body() {
    let program = Program::new().with_item(
        ClassDef::new("Main", ItemKind::Class).with_method(MethodDef::new("main")),
    );
    assert!(matches!(
        program.entry_point(),
        Err(EntryPointError::MissingMainBody)
    ));
}

#[test]
fn test_diagnostics_render() {
    assert_eq!(
        EntryPointError::MissingMainClass.to_string(),
        "no `Main` class found"
    );
    assert_eq!(
        EntryPointError::MainNotAClass(ItemKind::Function).to_string(),
        "`Main` must be a class, found a function"
    );
}
