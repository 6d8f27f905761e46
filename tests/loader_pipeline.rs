/// Whole-pipeline tests over on-disk projects: manifest discovery, `use`
/// resolution, multi-file compilation, and execution of the merged unit.

use std::fs;
use std::path::Path;

use prism::loader::{merge_files, Loader, MANIFEST_NAME};
use prism::vm::{BufferSink, Vm};
use prism::VmConfig;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, content).expect("write");
}

fn run_project(entry: &Path) -> String {
    let mut loader = Loader::for_entry(entry);
    let files = loader.load_program(entry).expect("modules load");
    assert!(
        !loader.diagnostics.has_errors(),
        "loader diagnostics: {:?}",
        loader.diagnostics.iter().collect::<Vec<_>>()
    );
    let merged = merge_files(files);

    let outcome = prism::Checker::new().check_file(&merged);
    assert!(
        outcome.ok,
        "check failed: {:?}",
        outcome.diagnostics.iter().collect::<Vec<_>>()
    );

    let program = prism::compile(&[merged]).expect("compiles");
    prism::verifier::verify_program(&program.functions).expect("verifies");

    let sink = BufferSink::new();
    let mut vm = Vm::with_output(VmConfig::default(), Box::new(sink.clone()));
    vm.install(program);
    vm.run().expect("runs");
    sink.contents()
}

#[test]
fn single_module_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir.path().join(MANIFEST_NAME), "namespace = \"app\"\n");
    write(
        &dir.path().join("src/app/util/Math.prism"),
        r#"
        function double(int $n): int { return $n * 2; }
        "#,
    );
    let entry = dir.path().join("src/app/main.prism");
    write(
        &entry,
        r#"
        use app.util.Math;
        echo double(21);
        "#,
    );
    assert_eq!(run_project(&entry), "42\n");
}

#[test]
fn classes_across_modules() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir.path().join(MANIFEST_NAME), "namespace = \"shop\"\n");
    write(
        &dir.path().join("src/shop/model/Item.prism"),
        r#"
        class Item {
            public string $name = "";
            public int $price = 0;
            public function constructor(string $name, int $price) {
                $this->name = $name;
                $this->price = $price;
            }
            public function label(): string {
                return $this->name + ":" + to_string($this->price);
            }
        }
        "#,
    );
    write(
        &dir.path().join("src/shop/model/Cart.prism"),
        r#"
        use shop.model.Item;
        class Cart {
            public int $total = 0;
            public function add(Item $item): void {
                $this->total = $this->total + $item->price;
            }
        }
        "#,
    );
    let entry = dir.path().join("src/shop/main.prism");
    write(
        &entry,
        r#"
        use shop.model.Cart;
        use shop.model.Item;
        $cart := new Cart();
        $a := new Item("tea", 3);
        $b := new Item("pot", 12);
        $cart->add($a);
        $cart->add($b);
        echo $a->label(); echo "|"; echo $cart->total;
        "#,
    );
    assert_eq!(run_project(&entry), "tea:3|15\n");
}

#[test]
fn diamond_imports_load_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir.path().join(MANIFEST_NAME), "namespace = \"d\"\n");
    write(&dir.path().join("src/d/Base.prism"), "function base(): int { return 1; }");
    write(
        &dir.path().join("src/d/Left.prism"),
        "use d.Base;\nfunction left(): int { return base() + 10; }",
    );
    write(
        &dir.path().join("src/d/Right.prism"),
        "use d.Base;\nfunction right(): int { return base() + 100; }",
    );
    let entry = dir.path().join("src/d/main.prism");
    write(&entry, "use d.Left;\nuse d.Right;\necho left() + right();");
    assert_eq!(run_project(&entry), "112\n");
}

#[test]
fn dependency_statements_do_not_execute() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir.path().join(MANIFEST_NAME), "namespace = \"q\"\n");
    write(
        &dir.path().join("src/q/Noisy.prism"),
        r#"
        function quiet(): int { return 7; }
        echo "should never print";
        "#,
    );
    let entry = dir.path().join("src/q/main.prism");
    write(&entry, "use q.Noisy;\necho quiet();");
    assert_eq!(run_project(&entry), "7\n");
}

#[test]
fn bytecode_image_roundtrip_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir.path().join(MANIFEST_NAME), "namespace = \"img\"\n");
    let entry = dir.path().join("src/img/main.prism");
    write(
        &entry,
        r#"
        function fib(int $n): int { if ($n < 2) { return $n; } return fib($n-1) + fib($n-2); }
        echo fib(12);
        "#,
    );

    let mut loader = Loader::for_entry(&entry);
    let files = loader.load_program(&entry).expect("loads");
    let merged = merge_files(files);
    let program = prism::compile(&[merged]).expect("compiles");

    // Serialize, reload (which verifies), and execute the reloaded image.
    let bytes = prism::container::write_program(&program);
    let reloaded = prism::container::read_program(&bytes).expect("image loads and verifies");

    let sink = BufferSink::new();
    let mut vm = Vm::with_output(VmConfig::default(), Box::new(sink.clone()));
    vm.install(reloaded);
    vm.run().expect("reloaded image runs");
    assert_eq!(sink.contents(), "144\n");
}
