use hilos::{
    ir::{Point, Program},
    pipeline,
    sim::{Bench, CoroutineState, Host, Machine},
};

fn program(text: &str) -> Program {
    pipeline::lowered(text).unwrap()
}

/// Transmisor serial con una bandera de "listo para enviar".
#[derive(Default)]
struct Uart {
    ready: bool,
    sent: Vec<i64>,
}

impl Host for Uart {
    fn read(&mut self, name: &str) -> i64 {
        match name {
            "UCSR0A" if self.ready => 1 << 5,
            _ => 0,
        }
    }

    fn write(&mut self, name: &str, value: i64) {
        if name == "UDR0" {
            self.sent.push(value);
            self.ready = false;
        }
    }

    fn call(&mut self, _: &str, _: &[i64]) -> i64 {
        0
    }
}

#[test]
fn uart_sends_one_byte_per_ready_edge() {
    let program = program(
        "extern volatile u8 UCSR0A;
         extern volatile u8 UDR0;
         static u8 n = 7;

         thread writer {
             sub send_byte(u8 byte) {
                 wait_until UCSR0A & (1 << 5);
                 UDR0 = byte;
             }

             call send_byte('A');
             call send_byte(n);
             yield;
         }

         main { }",
    );

    let writer = program.model.find_unit("writer").unwrap();
    let send = program.model.find_unit("writer.send_byte").unwrap();

    let mut machine = Machine::new(&program, Uart::default());
    machine.boot().unwrap();

    for ready in [false, true, false, true] {
        machine.host_mut().ready = ready;
        machine.pass().unwrap();

        if !ready {
            // Una subrutina esperando retiene a su llamador
            assert_eq!(machine.state(send), CoroutineState::Running(Point(0)));
            assert!(matches!(
                machine.state(writer),
                CoroutineState::AwaitingCallee { callee, .. } if callee == send
            ));
        }
    }

    assert_eq!(machine.host().sent, vec![65, 7]);
    assert_eq!(machine.state(writer), CoroutineState::Running(Point(2)));
    assert_eq!(machine.state(send), CoroutineState::Idle);
}

#[test]
fn call_then_recall_reenters_from_start() {
    let program = program(
        "thread t {
             static u8 rounds;

             sub s {
                 static u8 steps;
                 steps += 1;
                 yield;
                 steps += 1;
                 yield;
             }

             loop {
                 rounds += 1;
                 call s;
             }
         }

         main { }",
    );

    let mut machine = Machine::new(&program, Bench::new());
    machine.boot().unwrap();

    machine.pass().unwrap();
    machine.pass().unwrap();
    assert_eq!(machine.state_of("t.s"), Some(CoroutineState::Running(Point(1))));
    assert_eq!(machine.read_static("t.rounds"), Some(1));

    // `s` termina y la siguiente llamada comienza desde el principio
    machine.pass().unwrap();
    assert_eq!(machine.read_static("t.rounds"), Some(2));
    assert_eq!(machine.read_static("t.s.steps"), Some(3));
    assert_eq!(machine.state_of("t.s"), Some(CoroutineState::Running(Point(0))));
}

#[test]
fn yields_cycle_back_to_the_first_point() {
    let program = program(
        "thread t {
             static u8 visits[3];

             loop {
                 visits[0] += 1;
                 yield;
                 visits[1] += 1;
                 yield;
                 visits[2] += 1;
                 yield;
             }
         }

         main { }",
    );

    let mut machine = Machine::new(&program, Bench::new());
    machine.boot().unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        machine.pass().unwrap();
        seen.push(machine.state_of("t").unwrap());
    }

    let expected: Vec<_> = [0, 1, 2, 0]
        .into_iter()
        .map(|point| CoroutineState::Running(Point(point)))
        .collect();

    assert_eq!(seen, expected);

    let visits: Vec<_> = (0..3).map(|i| machine.read_element("t.visits", i).unwrap()).collect();
    assert_eq!(visits, vec![2, 1, 1]);
}

#[test]
fn finished_thread_starts_over() {
    let program = program(
        "thread t {
             static u8 runs;
             runs += 1;
             yield;
         }

         main { }",
    );

    let mut machine = Machine::new(&program, Bench::new());
    machine.boot().unwrap();

    machine.pass().unwrap();
    assert_eq!(machine.state_of("t"), Some(CoroutineState::Running(Point(0))));

    machine.pass().unwrap();
    assert_eq!(machine.state_of("t"), Some(CoroutineState::Idle));
    assert_eq!(machine.read_static("t.runs"), Some(1));

    machine.pass().unwrap();
    assert_eq!(machine.read_static("t.runs"), Some(2));
}

#[test]
fn wait_holds_state_until_its_condition_holds() {
    let program = program(
        "extern volatile u8 READY;

         thread t {
             static u8 progress;
             wait_until READY;
             progress = 1;
             yield;
         }

         main { }",
    );

    let t = program.model.find_unit("t").unwrap();

    let mut machine = Machine::new(&program, Bench::new());
    machine.boot().unwrap();

    machine.pass().unwrap();
    let parked = machine.raw_state(t);

    for _ in 0..5 {
        machine.pass().unwrap();
        assert_eq!(machine.raw_state(t), parked);
        assert_eq!(machine.read_static("t.progress"), Some(0));
    }

    machine.host_mut().set("READY", 1);
    machine.pass().unwrap();

    assert_eq!(machine.read_static("t.progress"), Some(1));
    assert_eq!(machine.state(t), CoroutineState::Running(Point(1)));
}

#[test]
fn periodic_hooks_follow_the_timebase() {
    let program = program(
        "static u16 tenths;
         static u8 seconds;

         every decisecond fast { tenths += 1; }
         every second slow { seconds += 1; }

         main { }",
    );

    let mut machine = Machine::new(&program, Bench::new());
    machine.boot().unwrap();

    for _ in 0..25 {
        machine.tick();
        machine.pass().unwrap();
    }

    assert_eq!(machine.read_static("tenths"), Some(25));
    assert_eq!(machine.read_static("seconds"), Some(2));

    // Ticks acumulados se consumen de uno en uno
    for _ in 0..3 {
        machine.tick();
    }

    machine.pass().unwrap();
    assert_eq!(machine.read_static("tenths"), Some(26));

    for _ in 0..3 {
        machine.pass().unwrap();
    }

    assert_eq!(machine.read_static("tenths"), Some(28));
    assert_eq!(machine.passes(), 29);
}

#[test]
fn boot_and_pass_order() {
    let program = program(
        "static u32 trace;

         thread t { loop { trace = trace * 10 + 3; yield; } }
         runnable poll { trace = trace * 10 + 2; }
         init first { trace = 1; }
         init second { trace = trace * 10 + 1; }

         main { trace = trace * 10 + 9; }",
    );

    let mut machine = Machine::new(&program, Bench::new());

    machine.boot().unwrap();
    assert_eq!(machine.read_static("trace"), Some(119));

    machine.pass().unwrap();
    machine.pass().unwrap();
    assert_eq!(machine.read_static("trace"), Some(1_192_323));
}
