use parapet::pathmatch::{clean, clean_masked, clean_request_path, matches};

#[test]
fn root_and_empty_match_everything() {
    for p in ["/", "/a", "/a/b/c", "/weird//path/../x"] {
        assert!(matches(p, "/", true), "{}", p);
        assert!(matches(p, "", true), "{}", p);
    }
}

#[test]
fn prefix_matching() {
    assert!(matches("/a/b/c", "/a/b", true));
    assert!(matches("/a/b", "/a/b", true));
    assert!(!matches("/a", "/a/b", true));
    assert!(!matches("/other", "/a", true));
}

#[test]
fn lengthening_base_never_flips_false_to_true() {
    let paths = ["/api/v1/users", "/api", "/static/css/site.css", "/x"];
    let bases = ["/a", "/ap", "/api", "/api/", "/api/v1", "/api/v1/users/extra"];
    for p in paths {
        let mut prev = true;
        for base in bases {
            let now = matches(p, base, true);
            if !prev {
                assert!(!now, "base {} flipped false->true for {}", base, p);
            }
            prev = now;
        }
    }
}

#[test]
fn case_sensitivity_flag() {
    assert!(!matches("/Admin/panel", "/admin", true));
    assert!(matches("/Admin/panel", "/admin", false));
}

#[test]
fn cleaning_collapses_and_resolves() {
    assert_eq!(clean("/a//b"), "/a/b");
    assert_eq!(clean("/a/./b"), "/a/b");
    assert_eq!(clean("/a/b/../c"), "/a/c");
    assert_eq!(clean("/../.."), "/");
    assert_eq!(clean("/"), "/");
    assert_eq!(clean(""), "/");
}

#[test]
fn trailing_slash_is_preserved_in_matching() {
    assert!(matches("/dir/sub/", "/dir/", true));
    assert!(!matches("/dirx", "/dir/", true));
}

#[test]
fn masked_cleaning_preserves_substrings() {
    assert_eq!(
        clean_request_path("/proxy/http://upstream//x"),
        "/proxy/http://upstream/x"
    );
    assert_eq!(clean_masked("/a//b", &["//"]), "/a//b");
}
