fn main() {
    hivegate::main();
}
