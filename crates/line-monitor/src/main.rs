fn main() {
    line_monitor::runtime::run_from_args();
}
