use hilos::{
    error::Warning,
    link::LinkError,
    machine::MachineError,
    pipeline::{self, Options},
    semantic::SemanticError,
};

fn thread_with_yields(count: usize) -> String {
    format!("thread t {{ {} }} main {{ }}", "yield; ".repeat(count))
}

#[test]
fn duplicate_threads_emit_nothing() {
    let diagnostics = pipeline::compile_str(
        "thread usart_writer { yield; }
         thread usart_writer { yield; }
         main { }",
        Options::default(),
    )
    .err()
    .unwrap();

    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(
        diagnostics.find::<SemanticError>(),
        Some((SemanticError::DuplicateName(name), location))
            if name.as_ref() == "usart_writer" && location.start().line() == 2
    ));

    let rendered = diagnostics.to_string();
    assert!(rendered.starts_with("semantic error: Name `usart_writer` is already defined"));
    assert!(rendered.ends_with("Build failed with 1 error\n"));
}

#[test]
fn unknown_references_are_fatal() {
    for text in [
        "thread t { call ghost; } main { }",
        "main { ghost = 1; }",
        "use_reg ghost; main { }",
        "tune ghost pure; main { }",
    ] {
        let diagnostics = pipeline::compile_str(text, Options::default()).err().unwrap();
        assert!(
            matches!(diagnostics.find::<SemanticError>(), Some((SemanticError::UnknownReference(name), _)) if name == "ghost"),
            "{}",
            text
        );
    }
}

#[test]
fn names_that_would_clash_in_c_are_rejected() {
    let cases = [
        // `t__n` choca con la estática `n` del hilo `t`
        ("static u8 t__n; thread t { static u8 n; yield; } main { }", "t__n"),
        ("thread t { static u8 a__b; sub a { static u8 b; } yield; } main { }", "a__b"),
        ("thread t_ { static u8 b; yield; } thread t { static u8 _b; yield; } main { }", "t_"),
        ("static u8 hilos_state__t; thread t { yield; } main { }", "hilos_state__t"),
        ("fn hilos_entry() { } main { }", "hilos_entry"),
        ("static u8 int; main { }", "int"),
        ("fn f(u8 unsigned) { } main { }", "unsigned"),
        ("main { let u8 timebase_ticks = 0; }", "timebase_ticks"),
    ];

    for (text, reserved) in cases {
        let diagnostics = pipeline::compile_str(text, Options::default()).err().unwrap();
        assert!(
            matches!(
                diagnostics.find::<SemanticError>(),
                Some((SemanticError::ReservedName(name), _)) if name.as_ref() == reserved
            ),
            "{}",
            text
        );
    }

    let compiled = pipeline::compile_str(
        "static u8 t_n; thread t { static u8 n; yield; } main { }",
        Options::default(),
    )
    .unwrap();

    let c = compiled.source_text();
    assert!(c.contains("uint8_t t_n;\n"));
    assert!(c.contains("uint8_t t__n;\n"));
}

#[test]
fn suspension_point_limit() {
    let byte = pipeline::compile_str(&thread_with_yields(254), Options::default()).unwrap();
    assert!(byte.source_text().contains("static uint8_t hilos_state__t;\n"));

    let word = pipeline::compile_str(&thread_with_yields(256), Options::default()).unwrap();
    assert!(word.source_text().contains("static uint16_t hilos_state__t;\n"));
    assert!(word.source_text().contains("\tcase 256: goto resume_255;\n"));

    let diagnostics = pipeline::compile_str(&thread_with_yields(257), Options::default())
        .err()
        .unwrap();

    assert!(matches!(
        diagnostics.find::<MachineError>(),
        Some((MachineError::SuspensionLimitExceeded { unit }, _)) if unit == "t"
    ));
}

#[test]
fn recursive_subroutines_overlap() {
    let direct = "thread t { sub s { call s; } call s; } main { }";
    let indirect = "thread t {
                        sub a { yield; call b; }
                        sub b { call a; }
                        call a;
                    }
                    main { }";

    for text in [direct, indirect] {
        let diagnostics = pipeline::compile_str(text, Options::default()).err().unwrap();
        assert!(diagnostics.contains::<LinkError>(), "{}", text);
    }

    let diagnostics = pipeline::compile_str(indirect, Options::default()).err().unwrap();
    assert!(matches!(
        diagnostics.find::<LinkError>(),
        Some((LinkError::OverlappingCall { callee, chain }, _))
            if callee == "t.a" && chain == "t.a -> t.b -> t.a"
    ));
}

#[test]
fn register_conflicts_only_warn() {
    let compiled = pipeline::compile_str(
        "static u8 first;
         static u8 second;
         use_reg first r4;
         use_reg second r4;
         main { }",
        Options::default(),
    )
    .unwrap();

    assert!(matches!(
        compiled.warnings(),
        [warning] if matches!(
            warning.as_ref(),
            Warning::ConflictingRegisterHint { path, owner, .. } if path == "second" && owner == "first"
        )
    ));

    let c = compiled.source_text();
    assert!(c.contains("register uint8_t first asm(\"r4\");\n"));
    assert!(c.contains("\nuint8_t second;\n"));
    assert_eq!(compiled.flags(), "-Os -ffixed-r4\n");
}

#[test]
fn tuning_conflicts_keep_no_inline() {
    let compiled = pipeline::compile_str(
        "fn helper() { }
         tune helper no_inline, always_inline;
         main { helper(); }",
        Options::default(),
    )
    .unwrap();

    assert!(matches!(
        compiled.warnings().first().map(|warning| warning.as_ref()),
        Some(Warning::ConflictingTuning(name)) if name == "helper"
    ));

    let c = compiled.source_text();
    assert!(c.contains("static HILOS_NO_INLINE void helper(void)"));
    assert!(!c.contains("HILOS_FORCE_INLINE void helper"));
}
