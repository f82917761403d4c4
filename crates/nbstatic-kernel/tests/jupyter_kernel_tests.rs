//! Execution through a real ipykernel over ZeroMQ
//!
//! Skipped when `python3` cannot import `ipykernel`.

use nbstatic_kernel::{
    ChainLauncher, ExecutorOptions, JupyterLauncher, Kernel, KernelError, KernelLauncher,
    KernelSpec, NotebookExecutor, SubprocessLauncher,
};
use nbstatic_notebook::{read_notebook, write_notebook, Cell, Notebook, Output};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn ipykernel_available() -> bool {
    Command::new("python3")
        .args(["-c", "import ipykernel"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Data directory holding a `python3` kernelspec that runs ipykernel
fn ipykernel_data_dir() -> TempDir {
    let data = tempfile::tempdir().unwrap();
    let dir = data.path().join("kernels").join("python3");
    fs::create_dir_all(&dir).unwrap();
    let kernel_json = serde_json::json!({
        "argv": ["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
        "display_name": "Python 3",
        "language": "python",
    });
    fs::write(dir.join("kernel.json"), kernel_json.to_string()).unwrap();
    data
}

fn launcher(data: &TempDir) -> JupyterLauncher {
    JupyterLauncher::new(vec![data.path().to_path_buf()]).with_figure_format("svg")
}

fn stdout_of(outputs: &[Output]) -> String {
    outputs
        .iter()
        .filter_map(|output| match output {
            Output::Stream { name, text, .. } if name == "stdout" => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_ipykernel_runs_cells_with_shared_state() {
    if !ipykernel_available() {
        eprintln!("ipykernel not available, skipping");
        return;
    }
    let data = ipykernel_data_dir();
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("input.txt"), "from disk").unwrap();

    let mut kernel = launcher(&data)
        .launch(&KernelSpec::named("python3"), work.path())
        .unwrap();
    let timeout = Duration::from_secs(60);

    let first = kernel.execute("x = 40\nprint('hello')", 1, timeout).unwrap();
    assert!(first.failure.is_none());
    assert_eq!(stdout_of(&first.outputs), "hello\n");

    let second = kernel.execute("x + 2", 2, timeout).unwrap();
    assert!(matches!(
        &second.outputs[..],
        [Output::ExecuteResult { data, .. }] if data.get_text("text/plain").as_deref() == Some("42")
    ));

    let third = kernel.execute("print(open('input.txt').read())", 3, timeout).unwrap();
    assert_eq!(stdout_of(&third.outputs), "from disk\n");

    let failed = kernel.execute("raise ValueError('bad')", 4, timeout).unwrap();
    let failure = failed.failure.unwrap();
    assert_eq!(failure.ename, "ValueError");
    assert_eq!(failure.evalue, "bad");
    assert!(matches!(failed.outputs.last(), Some(Output::Error { .. })));

    kernel.shutdown().unwrap();
}

#[test]
fn test_ipykernel_cell_timeout_kills_kernel() {
    if !ipykernel_available() {
        eprintln!("ipykernel not available, skipping");
        return;
    }
    let data = ipykernel_data_dir();
    let work = tempfile::tempdir().unwrap();
    let mut kernel = launcher(&data)
        .launch(&KernelSpec::named("python3"), work.path())
        .unwrap();
    let err = kernel
        .execute("import time\ntime.sleep(30)", 1, Duration::from_secs(2))
        .unwrap_err();
    assert!(matches!(err, KernelError::Timeout(_)));
    kernel.shutdown().unwrap();
}

#[test]
fn test_executor_prefers_installed_kernel() {
    if !ipykernel_available() {
        eprintln!("ipykernel not available, skipping");
        return;
    }
    let data = ipykernel_data_dir();
    let work = tempfile::tempdir().unwrap();
    let source = work.path().join("nb.ipynb");
    let target = work.path().join("out").join("nb.ipynb");
    write_notebook(
        &Notebook::from_cells(vec![Cell::code("import sys\nprint(type(get_ipython()).__name__)")]),
        &source,
    )
    .unwrap();

    let chain = ChainLauncher::default()
        .then(launcher(&data))
        .then(SubprocessLauncher::default());
    let executor = NotebookExecutor::new(Arc::new(chain), ExecutorOptions::default());
    executor.execute_file(&source, &target).unwrap();

    let executed = read_notebook(Path::new(&target)).unwrap();
    let Cell::Code(cell) = &executed.cells[0] else {
        panic!("expected a code cell");
    };
    assert_eq!(stdout_of(&cell.outputs), "ZMQInteractiveShell\n");
}
